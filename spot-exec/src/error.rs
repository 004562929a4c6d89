use std::path::PathBuf;

use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection to {addr} failed: {detail}")]
    Connect { addr: String, detail: String },

    #[error("authentication of {user}@{addr} failed: {detail}")]
    Auth {
        user: String,
        addr: String,
        detail: String,
    },

    #[error("proxy command failed: {detail}")]
    Proxy { detail: String },

    #[error("private key {0} not found")]
    KeyFile(PathBuf),

    #[error("command exited with status {code}")]
    Exit { code: i32 },

    #[error("no files matched {0:?}")]
    NoMatch(String),

    #[error("invalid glob pattern {pattern:?}: {detail}")]
    Pattern { pattern: String, detail: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("ssh: {0}")]
    Ssh(#[from] ssh2::Error),
}

impl ExecError {
    pub fn transfer<S: Into<String>>(detail: S) -> ExecError {
        ExecError::Transfer(detail.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }
}
