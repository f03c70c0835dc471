#![forbid(unsafe_code)]

pub mod backend;
pub mod bounded;
pub mod chat_log;

pub use backend::{BackendError, FileBackend, MemoryBackend, StorageBackend};
pub use bounded::{BoundedStore, StorageFault, DEFAULT_BUDGET_BYTES, STORAGE_KEY_PREFIX};
