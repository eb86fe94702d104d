//! Error types shared across the relay.
//!
//! Only `RelayError` crosses the library boundary. `DeliveryError` describes a
//! failed network send and stays inside the worker pool, where it drives the
//! retry policy.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Result alias used by every fallible relay operation.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced to callers of the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed URL, secret, event type or request, rejected synchronously.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown subscription or delivery id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A delivery chain ran out of attempts.
    #[error("delivery {attempt_id} exhausted its retries")]
    ExhaustedRetries { attempt_id: Uuid },

    /// The audit chain failed verification. Anything depending on audit
    /// completeness must stop and wait for manual investigation.
    #[error("audit chain broken at sequence {sequence_no}: {reason}")]
    ChainIntegrity { sequence_no: u64, reason: String },

    /// A two-phase approval token was rejected.
    #[error("approval rejected: {0}")]
    Approval(String),

    /// Optimistic concurrency check failed.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    /// Backing store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Shared infrastructure (HTTP client, runtime) could not be set up.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl RelayError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        RelayError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Failures of the append-only JSONL stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record in {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a single network send failed. Retried internally, never returned
/// from `emit`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection failed: {0}")]
    Connection(String),

    /// The endpoint answered with a non-2xx status.
    #[error("endpoint returned HTTP {0}")]
    HttpStatus(u16),
}
