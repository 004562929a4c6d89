use std::path::PathBuf;

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse playbook {path}: {detail}")]
    PlaybookParse { path: PathBuf, detail: String },

    #[error("invalid playbook: {0}")]
    PlaybookInvalid(String),

    #[error("cannot load inventory {path}: {detail}")]
    InventoryLoad { path: PathBuf, detail: String },

    #[error("target {0:?} not found")]
    TargetNotFound(String),

    #[error("target {0:?} resolved to no destinations")]
    TargetEmpty(String),

    #[error("task {0:?} not found")]
    TaskNotFound(String),

    #[error("cannot parse {0:?} as host:port")]
    HostPortParse(String),

    #[error("cannot parse duration {0:?}")]
    DurationParse(String),
}

impl ModelError {
    pub fn invalid<S: Into<String>>(msg: S) -> ModelError {
        ModelError::PlaybookInvalid(msg.into())
    }
}
