#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

const DOCUMENT_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("storage backend unavailable")]
    Unavailable,
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Synchronous string key/value primitive shared by everything in the same origin.
///
/// Keys are raw: namespacing is the caller's job.
pub trait StorageBackend: Send {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), BackendError>;
    fn remove(&mut self, key: &str) -> Result<(), BackendError>;
    fn keys(&self) -> Result<Vec<String>, BackendError>;

    /// Throwaway write + delete used to detect a disabled store.
    fn probe(&mut self, probe_key: &str) -> Result<(), BackendError> {
        self.set(probe_key, probe_key)?;
        self.remove(probe_key)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
    unavailable: bool,
    fail_writes: bool,
}

impl MemoryState {
    fn total_bytes_with(&self, key: &str, value: &str) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + key.len()
            + value.len()
    }
}

/// In-process backend. Clones share the same entries, so a test can keep a handle
/// to inspect raw keys or flip failure switches after handing one to a store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses writes once all entries together exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        let backend = Self::default();
        backend.lock().quota_bytes = Some(quota_bytes);
        backend
    }

    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn raw_get(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).cloned()
    }

    pub fn raw_set(&self, key: &str, value: &str) {
        self.lock()
            .entries
            .insert(key.to_string(), value.to_string());
    }

    pub fn raw_keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding this lock cannot leave the map half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable);
        }
        Ok(state.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable);
        }
        if state.fail_writes {
            return Err(BackendError::Io(io::Error::other("write rejected by backend")));
        }
        if let Some(quota) = state.quota_bytes {
            if state.total_bytes_with(key, value) > quota {
                return Err(BackendError::QuotaExceeded);
            }
        }
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable);
        }
        state.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        let state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable);
        }
        Ok(state.entries.keys().cloned().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StorageDocument {
    schema_version: u8,
    entries: BTreeMap<String, String>,
}

/// Durable backend: one JSON document, rewritten through a temp file + rename on
/// every mutation.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        let entries = read_document(&path)?
            .map(|doc| doc.entries)
            .unwrap_or_default();
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let doc = StorageDocument {
            schema_version: DOCUMENT_SCHEMA_VERSION,
            entries: entries.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.path, &serialized)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut next = self.entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        self.entries = next;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), BackendError> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        let mut next = self.entries.clone();
        next.remove(key);
        self.persist(&next)?;
        self.entries = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn probe(&mut self, _probe_key: &str) -> Result<(), BackendError> {
        let mut probe_path = self.path.clone();
        probe_path.set_extension("probe");
        if let Some(parent) = probe_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&probe_path, b"probe")?;
        fs::remove_file(&probe_path)?;
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Option<StorageDocument>, BackendError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Some(StorageDocument::default()));
    }
    let doc = serde_json::from_str::<StorageDocument>(&raw)?;
    if doc.schema_version != DOCUMENT_SCHEMA_VERSION {
        return Err(BackendError::Unavailable);
    }
    Ok(Some(doc))
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), BackendError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
