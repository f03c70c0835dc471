#![forbid(unsafe_code)]

//! Terminal handlers for failures nobody caught: panics on any thread, and tasks
//! whose result would otherwise be dropped on the floor.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;

use sharehub_contracts::error_log::{error_contexts, ErrorDetail};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error_reporter::ErrorReporter;

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "panic with non-string payload".to_string()
}

/// Chains a panic hook that records every panic before the previous hook runs.
pub fn install_panic_hook(reporter: ErrorReporter) {
    let previous = std::panic::take_hook();
    reporter.mark_panic_hook_installed();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location();
        reporter.report_message(
            panic_message(info.payload()),
            None,
            Some(error_contexts::GLOBAL_ERROR_HANDLER),
            Some(ErrorDetail::Panic {
                file: location.map(|l| l.file().to_string()),
                line: location.map(|l| l.line()),
                column: location.map(|l| l.column()),
            }),
        );
        previous(info);
    }));
}

/// Spawns `future` and records its failure instead of letting it vanish.
///
/// An `Err` outcome is recorded as an unhandled rejection. A panic is recorded the
/// same way unless the panic hook already captured it.
pub fn spawn_reported<F, E>(reporter: ErrorReporter, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::spawn(future).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let reason = err.to_string();
                reporter.report_message(
                    reason.clone(),
                    None,
                    Some(error_contexts::UNHANDLED_REJECTION),
                    Some(ErrorDetail::Rejection { reason }),
                );
            }
            Err(join_err) if join_err.is_panic() => {
                if reporter.panic_hook_installed() {
                    return;
                }
                let reason = panic_message(join_err.into_panic().as_ref());
                reporter.report_message(
                    reason.clone(),
                    None,
                    Some(error_contexts::UNHANDLED_REJECTION),
                    Some(ErrorDetail::Rejection { reason }),
                );
            }
            Err(_) => debug!("reported task cancelled"),
        }
    })
}
