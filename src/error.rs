//! Custom error types for the backend.
//!
//! This module defines the primary error type, `ScopeError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify failures, from attribute validation to remote
//! transport problems.
//!
//! ## Error taxonomy
//!
//! - **`Validation`**: an attribute write was rejected; the value is
//!   guaranteed unchanged. Never retried automatically.
//! - **`ReadOnly`**: a client attempted to write a read-only attribute.
//! - **`Config`**: the component tree could not be built from the
//!   declarative configuration. Fatal to startup, never retried.
//! - **`NotFound`**: a component, role or attribute lookup failed.
//! - **`Unreachable`** / **`Timeout`**: remote proxy boundary failures.
//!   `get`/`subscribe` may be retried a bounded number of times by the
//!   proxy layer; `set` is only retried on explicit caller request.
//! - **`InvalidRequest`**: acquisition parameters outside the hardware
//!   ranges advertised by the scanner/focus attributes.
//! - **`DriftLost`**: the drift estimator returned too many consecutive
//!   inconclusive results; the run terminates in `Failed`.
//! - **`Hardware`**: wraps an underlying device failure.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid acquisition request: {0}")]
    InvalidRequest(String),

    #[error("Drift correction lost after {consecutive} consecutive inconclusive estimates")]
    DriftLost { consecutive: u32 },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ScopeError {
    /// Whether the proxy layer may transparently retry the failed
    /// operation, provided the operation itself is idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScopeError::Timeout(_) | ScopeError::Io(_))
    }
}
