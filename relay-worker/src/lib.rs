//! Hookwire - at-least-once webhook delivery with an audit trail.
//!
//! Collaborators emit typed events; the relay fans them out to registered
//! subscriptions, signs every payload with HMAC-SHA256, retries transient
//! failures with exponential backoff, and records every mutating or terminal
//! action in a hash-chained audit log.
//!
//! ## Architecture
//!
//! ```text
//! emit → Dispatcher → Registry lookup → Ledger rows → Scheduler → WorkerPool
//!      → Signer → HTTP POST → Ledger update → (on exhaustion) AuditLog
//! ```
//!
//! Two binaries ship with the library:
//! - `hookwire`: worker pool plus the admin HTTP API
//! - `hookwire-verify`: checks a persisted audit log and fails on tampering

pub mod approval;
pub mod audit;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ledger;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod signer;
pub mod storage;
pub mod throttle;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{DeliveryError, RelayError, RelayResult, StoreError};
pub use event::{Event, EventType};
pub use ledger::{AttemptKind, AttemptStatus, DeliveryAttempt, FailureReason};
pub use registry::{ListFilter, RegisterRequest, SubscriptionStatus, SubscriptionView};
pub use relay::{Registration, Relay, RelayBuilder};
