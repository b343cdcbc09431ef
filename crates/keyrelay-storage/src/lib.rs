//! Persistence for the gateway's configuration document.
//!
//! Storage is used for bootstrap (`load`) and admin mutations (`save`) only.
//! Request handling never reads from here; it reads the in-memory snapshot.

pub mod document;
pub mod file;
pub mod memory;
pub mod storage;

pub use document::PersistedConfig;
pub use file::FileConfigStore;
pub use memory::MemoryConfigStore;
pub use storage::{ConfigStore, StorageError, StorageResult};
