#![forbid(unsafe_code)]

use std::sync::Arc;

use sharehub_storage::{BoundedStore, FileBackend, MemoryBackend, StorageFault};
use tracing::{info, warn};

use crate::config::SharehubConfig;
use crate::error_reporter::ErrorReporter;
use crate::http_provider::{HttpIdentityProvider, HttpProviderConfig};
use crate::identity_provider::IdentityProvider;
use crate::local_provider::LocalAccountRepository;
use crate::session::{SessionBootstrapper, SessionConfig, SessionSnapshot};
use crate::traps::install_panic_hook;

/// Wires store, reporter and session together for one application run.
#[derive(Debug)]
pub struct ClientCore {
    config: SharehubConfig,
    store: Arc<BoundedStore>,
    reporter: ErrorReporter,
    session: SessionBootstrapper,
}

impl ClientCore {
    /// Opens the file store (in-memory when the file cannot be opened) and picks
    /// the hosted provider when one is configured.
    pub fn from_config(config: SharehubConfig) -> Self {
        let (store, open_error) = match FileBackend::open(config.storage_path.clone()) {
            Ok(backend) => (
                Arc::new(BoundedStore::with_budget(backend, config.storage_budget_bytes)),
                None,
            ),
            Err(err) => {
                warn!(
                    path = %config.storage_path.display(),
                    error = %err,
                    "storage file unusable; keeping data in memory for this run"
                );
                (
                    Arc::new(BoundedStore::with_budget(
                        MemoryBackend::new(),
                        config.storage_budget_bytes,
                    )),
                    Some(StorageFault::Unavailable(err)),
                )
            }
        };
        let reporter = ErrorReporter::new(Arc::clone(&store));
        if let Some(fault) = open_error {
            reporter.report_storage_error("open", &fault);
        }

        let provider: Arc<dyn IdentityProvider> = match config.hosted_backend() {
            Some((url, key)) => match HttpIdentityProvider::new(HttpProviderConfig::new(url, key)) {
                Ok(http) => Arc::new(http.with_reporter(reporter.clone())),
                Err(err) => {
                    warn!(error = %err, "hosted backend misconfigured; using local accounts");
                    reporter.report_auth_error("hosted", &err);
                    Arc::new(LocalAccountRepository::new())
                }
            },
            None => Arc::new(LocalAccountRepository::new()),
        };
        Self::with_provider(config, store, reporter, provider)
    }

    pub fn with_provider(
        config: SharehubConfig,
        store: Arc<BoundedStore>,
        reporter: ErrorReporter,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        let session = SessionBootstrapper::new(
            SessionConfig {
                google_client_id: config.google_client_id.clone(),
            },
            provider,
            Arc::clone(&store),
            reporter.clone(),
        );
        Self {
            config,
            store,
            reporter,
            session,
        }
    }

    pub fn config(&self) -> &SharehubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BoundedStore> {
        &self.store
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn session(&self) -> &SessionBootstrapper {
        &self.session
    }

    /// Routes panics into the error log. Call once per process.
    pub fn install_traps(&self) {
        install_panic_hook(self.reporter.clone());
    }

    pub async fn start(&self) -> SessionSnapshot {
        let snapshot = self.session.start().await;
        info!(
            phase = snapshot.phase.as_str(),
            storage_available = self.store.is_available(),
            "client core started"
        );
        snapshot
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
    }
}
