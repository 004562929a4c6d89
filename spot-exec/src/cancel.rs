use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{ExecError, ExecResult};

/// Shared cancellation flag. One token is created per run and cloned
/// into every worker; flipping it makes all in-flight executor calls
/// return [`ExecError::Cancelled`] at their next suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Convenience guard for loops.
    pub fn check(&self) -> ExecResult<()> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }
}
