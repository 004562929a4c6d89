//! Executor abstraction over remote (SSH), local shell and dry-run
//! backends, plus the connector that establishes authenticated sessions.

mod cancel;
mod connector;
mod error;
mod exec;
pub mod utils;

pub use self::cancel::CancelToken;
pub use self::connector::{Connector, DEFAULT_TIMEOUT};
pub use self::error::{ExecError, ExecResult};
pub use self::exec::dry::Dry;
pub use self::exec::local::Local;
pub use self::exec::remote::Remote;
pub use self::exec::{CopyOpts, DeleteOpts, Executor, RunOpts, SyncOpts};

/// Marker kept in staged script paths; the dry-run executor uses it to
/// recognise a script invocation and echo the script body instead.
pub const SCRIPT_MARKER: &str = "spot-script";

/// Prefix of per-invocation temporary directories on the target host.
pub const TMP_PREFIX: &str = ".spot-";
