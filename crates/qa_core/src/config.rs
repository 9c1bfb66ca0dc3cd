use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const DEFAULT_DATA_PATH: &str = "./data/qa_data.json";
/// Output width of all-MiniLM-L6-v2.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_MAX_BACKUPS: usize = 10;

pub fn default_build_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_path: PathBuf,
    /// Upper bound on concurrent embedding calls while building a generation.
    pub build_concurrency: usize,
    pub backup_dir: Option<PathBuf>,
    pub max_backups: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            build_concurrency: default_build_concurrency(),
            backup_dir: None,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

impl EngineConfig {
    pub fn with_data_path(path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.build_concurrency == 0 {
            return Err(EngineError::Config(
                "build_concurrency must be > 0".to_string(),
            ));
        }
        if self.backup_dir.is_some() && self.max_backups == 0 {
            return Err(EngineError::Config(
                "max_backups must be > 0 when backup_dir is set".to_string(),
            ));
        }
        Ok(())
    }
}
