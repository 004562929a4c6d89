use std::time::Duration;

use thiserror::Error;

use spot_exec::ExecError;
use spot_model::ModelError;

pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("host {host}, command {cmd:?}: {source}")]
    Command {
        host: String,
        cmd: String,
        #[source]
        source: Box<RunError>,
    },

    #[error("wait for {cmd:?} timed out after {timeout:?}")]
    WaitTimeout { cmd: String, timeout: Duration },

    #[error("{0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("{0}")]
    Invalid(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{} host(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<RunError>),
}

impl RunError {
    pub fn invalid<S: Into<String>>(msg: S) -> RunError {
        RunError::Invalid(msg.into())
    }

    /// Attaches the host and command context to an underlying failure.
    pub fn on_host(host: &str, cmd: &str, err: RunError) -> RunError {
        RunError::Command {
            host: host.to_string(),
            cmd: cmd.to_string(),
            source: Box::new(err),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            RunError::Cancelled => true,
            RunError::Exec(e) => e.is_cancelled(),
            RunError::Command { source, .. } => source.is_cancelled(),
            RunError::Aggregate(errs) => errs.iter().all(|e| e.is_cancelled()),
            _ => false,
        }
    }
}

fn join_errors(errs: &[RunError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
