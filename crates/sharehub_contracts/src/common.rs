#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let ms = chrono::Utc::now().timestamp_millis();
        Self(u64::try_from(ms).unwrap_or(1).max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_token(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be non-empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| {
        !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.' || c == '|')
    }) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain token-safe ASCII only",
        });
    }
    Ok(())
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be non-empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

pub(crate) fn validate_email(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() > 254 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain '@'",
        });
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be local@domain",
        });
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain whitespace",
        });
    }
    Ok(())
}

pub(crate) fn validate_url(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    validate_text(field, value, 2048)?;
    let lower = value.to_ascii_lowercase();
    if !(lower.starts_with("https://")
        || lower.starts_with("http://")
        || lower.starts_with("data:image/")
        || lower.starts_with("memory://"))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be an http(s), data:image or memory URL",
        });
    }
    Ok(())
}
