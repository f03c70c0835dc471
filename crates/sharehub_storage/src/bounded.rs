#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sharehub_contracts::{ContractViolation, Validate};
use tracing::{debug, warn};

use crate::backend::{BackendError, StorageBackend};

pub const STORAGE_KEY_PREFIX: &str = "sharehub_";
pub const DEFAULT_BUDGET_BYTES: usize = 5 * 1024 * 1024;

/// Short-key substrings that mark data the store may drop to make room.
pub const NON_ESSENTIAL_KEY_PATTERNS: [&str; 3] = ["chat_history", "temp_data", "cache_"];

/// Keys dropped by [`BoundedStore::clear_volatile`] after an application fault.
pub const VOLATILE_KEYS: [&str; 2] = ["chat_messages", "temp_data"];

const PROBE_KEY: &str = "__storage_test__";

#[derive(Debug, thiserror::Error)]
pub enum StorageFault {
    #[error("storage is unavailable: {0}")]
    Unavailable(BackendError),
    #[error("failed to serialize value for '{key}': {source}")]
    Serialize {
        key: String,
        source: serde_json::Error,
    },
    #[error("stored value for '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error("stored value for '{key}' failed validation: {violation}")]
    InvalidRecord {
        key: String,
        violation: ContractViolation,
    },
    #[error("value for '{key}' needs {needed} bytes, {remaining} of {budget} remain after eviction")]
    OverBudget {
        key: String,
        needed: usize,
        remaining: usize,
        budget: usize,
    },
    #[error("backend {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        source: BackendError,
    },
}

impl StorageFault {
    /// Short name of the store operation, used as the error-report label.
    pub fn operation(&self) -> &'static str {
        match self {
            StorageFault::Unavailable(_) => "probe",
            StorageFault::Serialize { .. } => "serialize",
            StorageFault::Corrupt { .. } | StorageFault::InvalidRecord { .. } => "read",
            StorageFault::OverBudget { .. } => "budget",
            StorageFault::Backend { operation, .. } => *operation,
        }
    }
}

struct StoreInner {
    backend: Box<dyn StorageBackend>,
    last_fault: Option<StorageFault>,
}

/// Namespaced, size-bounded JSON store over a [`StorageBackend`].
///
/// Every public operation is fail-soft: failures come back as `false` or the caller's
/// default, and the most recent one is kept for [`BoundedStore::take_last_fault`].
pub struct BoundedStore {
    budget_bytes: usize,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for BoundedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedStore")
            .field("budget_bytes", &self.budget_bytes)
            .finish_non_exhaustive()
    }
}

pub fn namespaced_key(key: &str) -> String {
    format!("{STORAGE_KEY_PREFIX}{key}")
}

fn is_non_essential(short_key: &str) -> bool {
    NON_ESSENTIAL_KEY_PATTERNS
        .iter()
        .any(|pattern| short_key.contains(pattern))
}

impl BoundedStore {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::with_budget(backend, DEFAULT_BUDGET_BYTES)
    }

    pub fn with_budget(backend: impl StorageBackend + 'static, budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            inner: Mutex::new(StoreInner {
                backend: Box::new(backend),
                last_fault: None,
            }),
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let mut inner = self.lock();
        let result = match serde_json::to_string(value) {
            Ok(serialized) => inner.try_set(self.budget_bytes, key, &serialized),
            Err(source) => Err(StorageFault::Serialize {
                key: key.to_string(),
                source,
            }),
        };
        inner.settle(result).is_some()
    }

    /// Returns the stored value, or `default` when the key is missing, unreadable or
    /// the store is unavailable.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_optional(key).unwrap_or(default)
    }

    /// Like [`BoundedStore::get_item`] but additionally runs the record's contract
    /// checks; a stored value that parses but fails validation is treated as corrupt.
    pub fn get_record<T: DeserializeOwned + Validate>(&self, key: &str) -> Option<T> {
        let value: T = self.get_optional(key)?;
        if let Err(violation) = value.validate() {
            self.lock().settle::<()>(Err(StorageFault::InvalidRecord {
                key: key.to_string(),
                violation,
            }));
            return None;
        }
        Some(value)
    }

    fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.lock();
        let result = inner.try_get(key);
        inner.settle(result).flatten()
    }

    pub fn remove_item(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let result = inner.try_remove(key);
        inner.settle(result).is_some()
    }

    /// Removes every key under the namespace prefix and nothing else.
    pub fn clear(&self) -> bool {
        let mut inner = self.lock();
        let result = inner.try_clear();
        inner.settle(result).is_some()
    }

    pub fn clear_volatile(&self) -> bool {
        let mut inner = self.lock();
        let result = VOLATILE_KEYS
            .iter()
            .try_for_each(|key| inner.try_remove(key));
        inner.settle(result).is_some()
    }

    /// Bytes used by the namespace: key length plus serialized value length per entry.
    pub fn usage_bytes(&self) -> usize {
        let mut inner = self.lock();
        let result = inner.probe().and_then(|()| inner.usage());
        inner.settle(result).unwrap_or(0)
    }

    pub fn is_available(&self) -> bool {
        let mut inner = self.lock();
        let result = inner.probe();
        inner.settle(result).is_some()
    }

    /// Short keys (prefix stripped) currently held by the namespace.
    pub fn namespaced_keys(&self) -> Vec<String> {
        let mut inner = self.lock();
        let result = inner.probe().and_then(|()| inner.short_keys());
        inner.settle(result).unwrap_or_default()
    }

    pub fn take_last_fault(&self) -> Option<StorageFault> {
        self.lock().last_fault.take()
    }

    // Every backend write replaces a whole value, so a poisoned guard is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("bounded store lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl StoreInner {
    /// Converts an internal result into the fail-soft shape, remembering the fault.
    fn settle<T>(&mut self, result: Result<T, StorageFault>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(fault) => {
                warn!(operation = fault.operation(), error = %fault, "storage operation failed");
                self.last_fault = Some(fault);
                None
            }
        }
    }

    fn probe(&mut self) -> Result<(), StorageFault> {
        match self.backend.probe(PROBE_KEY) {
            Ok(()) => Ok(()),
            // A full store is still a usable store.
            Err(BackendError::QuotaExceeded) => Ok(()),
            Err(err) => Err(StorageFault::Unavailable(err)),
        }
    }

    fn try_get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, StorageFault> {
        self.probe()?;
        let raw = self
            .backend
            .get(&namespaced_key(key))
            .map_err(|source| StorageFault::Backend {
                operation: "get",
                source,
            })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageFault::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn try_set(&mut self, budget: usize, key: &str, serialized: &str) -> Result<(), StorageFault> {
        self.probe()?;
        let full_key = namespaced_key(key);
        let needed = full_key.len() + serialized.len();

        if self.usage_excluding(&full_key)? + needed > budget {
            warn!(key, needed, budget, "storage budget exceeded, evicting non-essential data");
            self.evict_non_essential();
            let used = self.usage_excluding(&full_key)?;
            if used + needed > budget {
                return Err(StorageFault::OverBudget {
                    key: key.to_string(),
                    needed,
                    remaining: budget.saturating_sub(used),
                    budget,
                });
            }
        }

        match self.backend.set(&full_key, serialized) {
            Ok(()) => Ok(()),
            Err(BackendError::QuotaExceeded) => {
                warn!(key, "backend quota exceeded, evicting and retrying once");
                self.evict_non_essential();
                self.backend
                    .set(&full_key, serialized)
                    .map_err(|source| StorageFault::Backend {
                        operation: "set",
                        source,
                    })
            }
            Err(source) => Err(StorageFault::Backend {
                operation: "set",
                source,
            }),
        }
    }

    fn try_remove(&mut self, key: &str) -> Result<(), StorageFault> {
        self.probe()?;
        self.backend
            .remove(&namespaced_key(key))
            .map_err(|source| StorageFault::Backend {
                operation: "remove",
                source,
            })
    }

    fn try_clear(&mut self) -> Result<(), StorageFault> {
        self.probe()?;
        for key in self.full_keys()? {
            self.backend
                .remove(&key)
                .map_err(|source| StorageFault::Backend {
                    operation: "clear",
                    source,
                })?;
        }
        Ok(())
    }

    /// Drops every namespaced key matching a non-essential pattern, in key order.
    /// Individual failures are logged and skipped.
    fn evict_non_essential(&mut self) -> usize {
        let keys = match self.full_keys() {
            Ok(keys) => keys,
            Err(fault) => {
                warn!(error = %fault, "eviction could not list keys");
                return 0;
            }
        };
        let mut evicted = 0;
        for full_key in keys {
            let short_key = &full_key[STORAGE_KEY_PREFIX.len()..];
            if !is_non_essential(short_key) {
                continue;
            }
            match self.backend.remove(&full_key) {
                Ok(()) => {
                    debug!(key = short_key, "evicted non-essential key");
                    evicted += 1;
                }
                Err(err) => warn!(key = short_key, error = %err, "eviction failed"),
            }
        }
        evicted
    }

    fn full_keys(&self) -> Result<Vec<String>, StorageFault> {
        let keys = self.backend.keys().map_err(|source| StorageFault::Backend {
            operation: "keys",
            source,
        })?;
        Ok(keys
            .into_iter()
            .filter(|key| key.starts_with(STORAGE_KEY_PREFIX))
            .collect())
    }

    fn short_keys(&self) -> Result<Vec<String>, StorageFault> {
        Ok(self
            .full_keys()?
            .into_iter()
            .map(|key| key[STORAGE_KEY_PREFIX.len()..].to_string())
            .collect())
    }

    fn usage(&self) -> Result<usize, StorageFault> {
        self.usage_excluding("")
    }

    fn usage_excluding(&self, skip_full_key: &str) -> Result<usize, StorageFault> {
        let mut total = 0usize;
        for key in self.full_keys()? {
            if key == skip_full_key {
                continue;
            }
            let value = self
                .backend
                .get(&key)
                .map_err(|source| StorageFault::Backend {
                    operation: "get",
                    source,
                })?
                .unwrap_or_default();
            total += key.len() + value.len();
        }
        Ok(total)
    }
}
