#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use sharehub_storage::DEFAULT_BUDGET_BYTES;

pub const GOOGLE_CLIENT_ID_PLACEHOLDER: &str = "your_google_client_id_here";
pub const MIN_STORAGE_BUDGET_BYTES: usize = 1024;
pub const MAX_STORAGE_BUDGET_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharehubConfig {
    pub storage_path: PathBuf,
    pub storage_budget_bytes: usize,
    pub backend_url: Option<String>,
    pub backend_anon_key: Option<String>,
    pub google_client_id: Option<String>,
}

impl SharehubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            storage_path: non_blank("SHAREHUB_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_storage_path(&lookup)),
            storage_budget_bytes: non_blank("SHAREHUB_STORAGE_BUDGET_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .map(|v| v.clamp(MIN_STORAGE_BUDGET_BYTES, MAX_STORAGE_BUDGET_BYTES))
                .unwrap_or(DEFAULT_BUDGET_BYTES),
            backend_url: non_blank("SHAREHUB_BACKEND_URL"),
            backend_anon_key: non_blank("SHAREHUB_BACKEND_ANON_KEY"),
            google_client_id: non_blank("SHAREHUB_GOOGLE_CLIENT_ID"),
        }
    }

    /// Client id for the federated prompt, or `None` when unset or still the
    /// placeholder from the sample environment file.
    pub fn federated_client_id(&self) -> Option<&str> {
        configured_client_id(self.google_client_id.as_deref())
    }

    /// `(url, anon_key)` when both halves of the hosted backend are configured.
    pub fn hosted_backend(&self) -> Option<(&str, &str)> {
        match (&self.backend_url, &self.backend_anon_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }
}

pub fn configured_client_id(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|id| !id.is_empty() && *id != GOOGLE_CLIENT_ID_PLACEHOLDER)
}

fn default_storage_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(xdg_config_home) = lookup("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg_config_home)
            .join("sharehub")
            .join("storage.json");
    }
    if let Some(home) = lookup("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home)
            .join(".config")
            .join("sharehub")
            .join("storage.json");
    }
    PathBuf::from(".sharehub").join("storage.json")
}
