use std::path::PathBuf;

use jobsift_adapters::SourceError;
use jobsift_core::ConfigValidationError;
use jobsift_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid preferences {path}: {source}")]
    InvalidPreferences {
        path: PathBuf,
        #[source]
        source: ConfigValidationError,
    },
    #[error("preferences file {path}: {source}")]
    PreferencesIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding preferences: {0}")]
    PreferencesEncode(#[from] serde_yaml::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("a pipeline cycle is already running")]
    CycleInProgress,
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn validation(&self) -> Option<&ConfigValidationError> {
        match self {
            Self::InvalidPreferences { source, .. } => Some(source),
            _ => None,
        }
    }
}
