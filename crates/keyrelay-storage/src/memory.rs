use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::document::PersistedConfig;
use crate::storage::{ConfigStore, StorageError, StorageResult};

/// Keeps the document in memory. Saves can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    doc: Mutex<PersistedConfig>,
    fail_saves: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new(doc: PersistedConfig) -> Self {
        Self {
            doc: Mutex::new(doc),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> PersistedConfig {
        self.doc.lock().await.clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> StorageResult<PersistedConfig> {
        Ok(self.doc.lock().await.clone())
    }

    async fn save(&self, doc: &PersistedConfig) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("save rejected".to_string()));
        }
        *self.doc.lock().await = doc.clone();
        Ok(())
    }
}
