#![forbid(unsafe_code)]

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::common::validate_text;
use crate::{ContractViolation, Validate};

pub const ERROR_LOG_CAPACITY: usize = 50;

pub mod error_contexts {
    pub const STORAGE_OPERATION: &str = "Storage Operation";
    pub const NETWORK_REQUEST: &str = "Network Request";
    pub const AUTHENTICATION: &str = "Authentication";
    pub const GLOBAL_ERROR_HANDLER: &str = "Global Error Handler";
    pub const UNHANDLED_REJECTION: &str = "Unhandled Promise Rejection";
}

/// Structured payload attached to an error record. Each failure site gets its own
/// variant so downstream tooling can filter by origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetail {
    Storage {
        operation: String,
    },
    Network {
        url: String,
    },
    Auth {
        provider: String,
    },
    Panic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },
    Rejection {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
    pub user_agent: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<ErrorDetail>,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    #[serde(flatten)]
    pub environment: EnvironmentDescriptor,
}

impl Validate for ErrorRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("error_record.id", &self.id, 64)?;
        // Messages come from arbitrary failure sites; only bound the size.
        if self.message.len() > 8 * 1024 {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.message",
                reason: "exceeds max length",
            });
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.timestamp",
                reason: "must be RFC 3339",
            });
        }
        Ok(())
    }
}

/// Fixed-capacity error log. Pushing past capacity drops the oldest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRing {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Rebuilds a ring from stored records, keeping only the newest `capacity`.
    pub fn from_records(capacity: usize, records: Vec<ErrorRecord>) -> Self {
        let mut ring = Self::new(capacity);
        for record in records {
            ring.push(record);
        }
        ring
    }

    pub fn push(&mut self, record: ErrorRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }

    pub fn into_vec(self) -> Vec<ErrorRecord> {
        self.records.into()
    }
}
