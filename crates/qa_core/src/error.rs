use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load QA data from {path}: {reason}")]
    DataLoad { path: PathBuf, reason: String },

    #[error("failed to persist QA data to {path}: {source}")]
    DataPersist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error("invalid QA pair '{id}': {reason}")]
    InvalidQaPair { id: String, reason: String },

    #[error("QA engine is not initialized")]
    NotReady,

    #[error("a reload is already in progress")]
    ReloadInProgress,

    #[error("invalid engine configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DataLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DataPersist {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
