use std::path::PathBuf;

use async_trait::async_trait;

use crate::document::PersistedConfig;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Loads and saves the whole configuration document.
///
/// `save` replaces the stored document; callers hold their own lock so saves
/// never interleave.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Missing documents load as `PersistedConfig::default()`.
    async fn load(&self) -> StorageResult<PersistedConfig>;
    async fn save(&self, doc: &PersistedConfig) -> StorageResult<()>;
}
