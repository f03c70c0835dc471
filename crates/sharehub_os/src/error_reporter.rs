#![forbid(unsafe_code)]

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sharehub_contracts::error_log::{
    error_contexts, EnvironmentDescriptor, ErrorDetail, ErrorRecord, ErrorRing,
    ERROR_LOG_CAPACITY,
};
use sharehub_storage::BoundedStore;
use tracing::{error, warn};

pub const ERROR_LOGS_KEY: &str = "error_logs";
pub const DEFAULT_LOCATION: &str = "app://sharehub/";

struct ReporterShared {
    store: Arc<BoundedStore>,
    environment: RwLock<EnvironmentDescriptor>,
    // Serializes read-modify-write of the persisted ring.
    append_lock: Mutex<()>,
    panic_hook_installed: AtomicBool,
}

/// Process-wide error sink. Cheap to clone; every clone appends to the same ring.
#[derive(Clone)]
pub struct ErrorReporter {
    shared: Arc<ReporterShared>,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter").finish_non_exhaustive()
    }
}

pub fn default_user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Flattens an error's `source()` chain into a stack-like trace.
pub fn error_chain_trace(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut source = err.source();
    if source.is_none() {
        return None;
    }
    let mut trace = String::new();
    while let Some(cause) = source {
        let _ = writeln!(trace, "caused by: {cause}");
        source = cause.source();
    }
    Some(trace.trim_end().to_string())
}

impl ErrorReporter {
    pub fn new(store: Arc<BoundedStore>) -> Self {
        Self {
            shared: Arc::new(ReporterShared {
                store,
                environment: RwLock::new(EnvironmentDescriptor {
                    user_agent: default_user_agent(),
                    url: DEFAULT_LOCATION.to_string(),
                }),
                append_lock: Mutex::new(()),
                panic_hook_installed: AtomicBool::new(false),
            }),
        }
    }

    /// Updates the location stamped on subsequent records.
    pub fn set_location(&self, url: impl Into<String>) {
        match self.shared.environment.write() {
            Ok(mut env) => env.url = url.into(),
            Err(_) => warn!("error reporter environment lock poisoned"),
        }
    }

    pub fn report_error(
        &self,
        err: &(dyn StdError + 'static),
        context: Option<&str>,
        additional_data: Option<ErrorDetail>,
    ) -> ErrorRecord {
        self.report_message(
            err.to_string(),
            error_chain_trace(err),
            context,
            additional_data,
        )
    }

    /// Records a failure that has no `Error` value, e.g. a panic payload.
    pub fn report_message(
        &self,
        message: impl Into<String>,
        stack: Option<String>,
        context: Option<&str>,
        additional_data: Option<ErrorDetail>,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            stack,
            context: context.map(str::to_string),
            additional_data,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            environment: self.environment(),
        };
        error!(
            id = %record.id,
            context = record.context.as_deref().unwrap_or("-"),
            message = %record.message,
            "error reported"
        );
        self.persist(&record);
        record
    }

    pub fn report_storage_error(
        &self,
        operation: &str,
        err: &(dyn StdError + 'static),
    ) -> ErrorRecord {
        self.report_error(
            err,
            Some(error_contexts::STORAGE_OPERATION),
            Some(ErrorDetail::Storage {
                operation: operation.to_string(),
            }),
        )
    }

    pub fn report_network_error(&self, url: &str, err: &(dyn StdError + 'static)) -> ErrorRecord {
        self.report_error(
            err,
            Some(error_contexts::NETWORK_REQUEST),
            Some(ErrorDetail::Network {
                url: url.to_string(),
            }),
        )
    }

    pub fn report_auth_error(
        &self,
        provider: &str,
        err: &(dyn StdError + 'static),
    ) -> ErrorRecord {
        self.report_error(
            err,
            Some(error_contexts::AUTHENTICATION),
            Some(ErrorDetail::Auth {
                provider: provider.to_string(),
            }),
        )
    }

    /// Stored records, oldest first. Empty when storage is unavailable or corrupt.
    pub fn stored_errors(&self) -> Vec<ErrorRecord> {
        let records: Vec<ErrorRecord> = self.shared.store.get_item(ERROR_LOGS_KEY, Vec::new());
        if records.len() > ERROR_LOG_CAPACITY {
            return ErrorRing::from_records(ERROR_LOG_CAPACITY, records).into_vec();
        }
        records
    }

    pub fn clear_stored_errors(&self) {
        let _guard = self.shared.append_lock.lock();
        if !self.shared.store.remove_item(ERROR_LOGS_KEY) {
            let fault = self.shared.store.take_last_fault();
            warn!(error = ?fault, "failed to clear error logs");
        }
    }

    pub(crate) fn mark_panic_hook_installed(&self) {
        self.shared
            .panic_hook_installed
            .store(true, Ordering::SeqCst);
    }

    pub(crate) fn panic_hook_installed(&self) -> bool {
        self.shared.panic_hook_installed.load(Ordering::SeqCst)
    }

    fn environment(&self) -> EnvironmentDescriptor {
        match self.shared.environment.read() {
            Ok(env) => env.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn persist(&self, record: &ErrorRecord) {
        let _guard = self
            .shared
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ring = ErrorRing::from_records(ERROR_LOG_CAPACITY, self.stored_errors());
        ring.push(record.clone());
        let records = ring.into_vec();
        if !self.shared.store.set_item(ERROR_LOGS_KEY, &records) {
            // Reporting this through the reporter would recurse; a log line is enough.
            let fault = self.shared.store.take_last_fault();
            warn!(error = ?fault, "failed to store error log");
        }
    }
}
