//! Terminal output for the runner: per-host prefixed writers, secret
//! masking and the global logger used for non-verbose debug/warn routing.

use lazy_static::lazy_static;
use parking_lot::RwLock;

mod mask;
mod term;
mod writer;

pub use self::mask::Masker;
pub use self::term::{init_term_logger, TermLogger};
pub use self::writer::{host_color, HostLog, StreamKind};

lazy_static! {
    static ref GLOBAL_MASKER: RwLock<Masker> = RwLock::new(Masker::empty());
}

/// Registers secrets with the process-wide masker consulted by the
/// terminal logger. Host writers keep their own copy as well, so values
/// are masked on both output paths.
pub fn add_global_secrets(secrets: &[String]) {
    GLOBAL_MASKER.write().add(secrets);
}

pub(crate) fn mask_global(line: &str) -> String {
    GLOBAL_MASKER.read().apply(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_masker_accumulates() {
        add_global_secrets(&["s3cr3t".to_string()]);
        assert_eq!(mask_global("token s3cr3t here"), "token **** here");
    }
}
