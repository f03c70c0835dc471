#![forbid(unsafe_code)]

use std::time::Duration;

use sharehub_os::error_reporter::ErrorReporter;
use sharehub_os::session::{SessionBootstrapper, SessionPhase, SessionSnapshot};
use sharehub_storage::BoundedStore;

pub const SIGN_IN_EVENT_WAIT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionArgs<'a> {
    pub email: Option<&'a str>,
    pub password: Option<&'a str>,
    pub name: Option<&'a str>,
}

pub fn execute_errors_command(reporter: &ErrorReporter, subcommand: &str) -> Result<String, String> {
    match subcommand {
        "ls" => Ok(reporter
            .stored_errors()
            .iter()
            .map(|r| {
                format!(
                    "{}  {}  {}",
                    r.timestamp,
                    r.context.as_deref().unwrap_or("-"),
                    r.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")),
        "clear" => {
            reporter.clear_stored_errors();
            Ok("OK".to_string())
        }
        _ => Err(format!(
            "unknown errors subcommand: {subcommand}. expected one of: ls, clear"
        )),
    }
}

pub fn execute_storage_command(store: &BoundedStore, subcommand: &str) -> Result<String, String> {
    match subcommand {
        "usage" => {
            if !store.is_available() {
                return Err("storage unavailable".to_string());
            }
            Ok(format!(
                "{} / {} bytes",
                store.usage_bytes(),
                store.budget_bytes()
            ))
        }
        "keys" => Ok(store.namespaced_keys().join("\n")),
        "clear-volatile" => {
            if store.clear_volatile() {
                Ok("OK".to_string())
            } else {
                Err("failed to clear volatile data".to_string())
            }
        }
        "clear" => {
            if store.clear() {
                Ok("OK".to_string())
            } else {
                Err("failed to clear storage".to_string())
            }
        }
        _ => Err(format!(
            "unknown storage subcommand: {subcommand}. expected one of: usage, keys, clear-volatile, clear"
        )),
    }
}

pub fn execute_chat_command(store: &BoundedStore, subcommand: &str) -> Result<String, String> {
    match subcommand {
        "ls" => Ok(store
            .chat_messages()
            .iter()
            .map(|m| {
                format!(
                    "{} [{}] {}: {}",
                    m.timestamp_ms.0, m.conversation_id, m.sender_id, m.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n")),
        "clear" => {
            if store.clear_chat_messages() {
                Ok("OK".to_string())
            } else {
                Err("failed to clear chat messages".to_string())
            }
        }
        _ => Err(format!(
            "unknown chat subcommand: {subcommand}. expected one of: ls, clear"
        )),
    }
}

pub fn format_snapshot(snapshot: &SessionSnapshot) -> String {
    match &snapshot.identity {
        Some(identity) => format!(
            "{} {} {} <{}> ({})",
            snapshot.phase.as_str(),
            identity.id,
            identity.name,
            identity.email,
            identity.provider.as_str()
        ),
        None => snapshot.phase.as_str().to_string(),
    }
}

/// Runs a session subcommand against an already started bootstrapper.
pub async fn execute_session_command(
    session: &SessionBootstrapper,
    subcommand: &str,
    args: SessionArgs<'_>,
) -> Result<String, String> {
    match subcommand {
        "status" => Ok(format_snapshot(&session.current())),
        "sign-in" => {
            let email = require(args.email, "email")?;
            let password = require(args.password, "password")?;
            let mut rx = session.subscribe();
            session
                .sign_in_with_password(email, password)
                .await
                .map_err(|e| e.to_string())?;
            let waited = tokio::time::timeout(
                Duration::from_millis(SIGN_IN_EVENT_WAIT_MS),
                rx.wait_for(|s| s.phase == SessionPhase::Authenticated),
            )
            .await;
            match waited {
                Ok(Ok(snapshot)) => Ok(format_snapshot(&snapshot)),
                _ => Err("signed in, but the session event never arrived".to_string()),
            }
        }
        "sign-up" => {
            let email = require(args.email, "email")?;
            let password = require(args.password, "password")?;
            session
                .sign_up_with_password(email, password, args.name.unwrap_or_default())
                .await
                .map_err(|e| e.to_string())?;
            Ok(format_snapshot(&session.current()))
        }
        "sign-out" => {
            session.sign_out().await;
            Ok("OK".to_string())
        }
        _ => Err(format!(
            "unknown session subcommand: {subcommand}. expected one of: status, sign-in, sign-up, sign-out"
        )),
    }
}

fn require<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("missing {what}"))
}
