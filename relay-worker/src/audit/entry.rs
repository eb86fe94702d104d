//! Audit entries and hash-chain verification.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Actions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    WebhookRegistered,
    WebhookEnabled,
    WebhookDisabled,
    WebhookDeleted,
    WebhookTested,
    DeliveryExhausted,
    DeliveryManualRetry,
    ApprovalProposed,
    ApprovalConsumed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::WebhookRegistered => "webhook_registered",
            AuditAction::WebhookEnabled => "webhook_enabled",
            AuditAction::WebhookDisabled => "webhook_disabled",
            AuditAction::WebhookDeleted => "webhook_deleted",
            AuditAction::WebhookTested => "webhook_tested",
            AuditAction::DeliveryExhausted => "delivery_exhausted",
            AuditAction::DeliveryManualRetry => "delivery_manual_retry",
            AuditAction::ApprovalProposed => "approval_proposed",
            AuditAction::ApprovalConsumed => "approval_consumed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One link of the audit chain.
///
/// `entry_hash = SHA-256(prev_hash || canonical(sequence_no, timestamp,
/// actor, action, payload_digest))`. Editing any field, dropping an entry or
/// swapping two entries breaks either this hash or the next entry's
/// `prev_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    /// Hash of the acted-on data; never the data itself.
    pub payload_digest: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Build the entry that follows `prev_hash`.
    pub fn chained(
        sequence_no: u64,
        timestamp: DateTime<Utc>,
        actor: &str,
        action: &str,
        payload_digest: &str,
        prev_hash: &str,
    ) -> Self {
        let entry_hash = chain_hash(prev_hash, sequence_no, &timestamp, actor, action, payload_digest);
        Self {
            sequence_no,
            timestamp,
            actor: actor.to_string(),
            action: action.to_string(),
            payload_digest: payload_digest.to_string(),
            prev_hash: prev_hash.to_string(),
            entry_hash,
        }
    }

    /// Recompute `entry_hash` from the stored fields.
    pub fn recompute_hash(&self) -> String {
        chain_hash(
            &self.prev_hash,
            self.sequence_no,
            &self.timestamp,
            &self.actor,
            &self.action,
            &self.payload_digest,
        )
    }
}

fn chain_hash(
    prev_hash: &str,
    sequence_no: u64,
    timestamp: &DateTime<Utc>,
    actor: &str,
    action: &str,
    payload_digest: &str,
) -> String {
    // A JSON array keeps field boundaries unambiguous.
    let canonical = serde_json::json!([
        sequence_no,
        timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        actor,
        action,
        payload_digest,
    ]);

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash the acted-on data for an audit entry.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn payload_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// First point where a chain stops verifying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub sequence_no: u64,
    pub reason: String,
}

/// Walk `entries` from genesis, recomputing every hash.
///
/// Returns the number of verified entries, or the first broken link.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<usize, ChainBreak> {
    let mut prev_hash = GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = index as u64 + 1;

        if entry.sequence_no != expected_sequence {
            return Err(ChainBreak {
                sequence_no: entry.sequence_no,
                reason: format!("expected sequence {expected_sequence}, found {}", entry.sequence_no),
            });
        }

        if entry.prev_hash != prev_hash {
            return Err(ChainBreak {
                sequence_no: entry.sequence_no,
                reason: "prev_hash does not link to the preceding entry".to_string(),
            });
        }

        if entry.recompute_hash() != entry.entry_hash {
            return Err(ChainBreak {
                sequence_no: entry.sequence_no,
                reason: "entry_hash mismatch".to_string(),
            });
        }

        prev_hash = &entry.entry_hash;
    }

    Ok(entries.len())
}
