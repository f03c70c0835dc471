#![forbid(unsafe_code)]

pub mod chat;
pub mod common;
pub mod error_log;
pub mod identity;

pub use common::{ContractViolation, UnixTimeMs, Validate};
