//! Delivery attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::event::Event;

/// Lifecycle of one attempt.
///
/// `pending -> in_flight -> {success, failed_permanent, scheduled_retry,
/// exhausted}`. A `scheduled_retry` row is final for its own try; the chain
/// continues in a new `pending` row with the next attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InFlight,
    Success,
    FailedPermanent,
    ScheduledRetry,
    Exhausted,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::InFlight => "in_flight",
            AttemptStatus::Success => "success",
            AttemptStatus::FailedPermanent => "failed_permanent",
            AttemptStatus::ScheduledRetry => "scheduled_retry",
            AttemptStatus::Exhausted => "exhausted",
        }
    }

    /// Terminal for the whole chain.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Success | AttemptStatus::FailedPermanent | AttemptStatus::Exhausted
        )
    }

    /// Still waiting to run or running.
    pub fn is_open(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::InFlight)
    }
}

/// What started the attempt chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Standard,
    Test,
    ManualRetry,
}

/// Why an attempt did not succeed (or was returned to the queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SubscriptionInactive,
    HttpStatus,
    RateLimited,
    Timeout,
    ConnectionRefused,
    ConnectionError,
    LeaseExpired,
    EventMissing,
}

impl From<&DeliveryError> for FailureReason {
    fn from(err: &DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout => FailureReason::Timeout,
            DeliveryError::ConnectionRefused => FailureReason::ConnectionRefused,
            DeliveryError::Connection(_) => FailureReason::ConnectionError,
            DeliveryError::HttpStatus(429) => FailureReason::RateLimited,
            DeliveryError::HttpStatus(_) => FailureReason::HttpStatus,
        }
    }
}

/// A worker's temporary exclusive claim on an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One network send try for an (event, subscription) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    /// Shared by every attempt of one retry chain.
    pub chain_id: Uuid,
    pub event_id: String,
    pub webhook_id: Uuid,
    pub attempt_number: u32,
    pub kind: AttemptKind,
    pub status: AttemptStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub response_code: Option<u16>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub reason: Option<FailureReason>,
    pub lease: Option<Lease>,
    /// Earliest time a worker may run this attempt.
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final result a worker reports for a leased attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success {
        response_code: u16,
    },
    FailedPermanent {
        response_code: Option<u16>,
        reason: FailureReason,
    },
    ScheduledRetry {
        response_code: Option<u16>,
        reason: FailureReason,
        next_retry_at: DateTime<Utc>,
    },
    Exhausted {
        response_code: Option<u16>,
        reason: FailureReason,
    },
}

impl AttemptOutcome {
    pub fn status(&self) -> AttemptStatus {
        match self {
            AttemptOutcome::Success { .. } => AttemptStatus::Success,
            AttemptOutcome::FailedPermanent { .. } => AttemptStatus::FailedPermanent,
            AttemptOutcome::ScheduledRetry { .. } => AttemptStatus::ScheduledRetry,
            AttemptOutcome::Exhausted { .. } => AttemptStatus::Exhausted,
        }
    }
}

/// Record written to the ledger store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    /// Event snapshot for a chain, written once when the chain opens.
    Chain { chain_id: Uuid, event: Event },
    /// Full attempt row, written on every state change.
    Attempt(DeliveryAttempt),
}
