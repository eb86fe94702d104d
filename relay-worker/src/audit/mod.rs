//! Tamper-evident audit log.
//!
//! Appends from any number of callers are serialized through one lock that
//! owns the chain tail, so sequence numbers and `prev_hash` links are
//! assigned strictly in order. Entries are never rewritten or removed.

pub mod entry;

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{error, info};

use crate::error::{RelayError, RelayResult};
use crate::storage::JsonlStore;

pub use entry::{payload_digest, verify_entries, AuditAction, AuditEntry, ChainBreak, GENESIS_HASH};

struct ChainTail {
    entries: Vec<AuditEntry>,
}

impl ChainTail {
    fn next_sequence(&self) -> u64 {
        self.entries.last().map(|e| e.sequence_no + 1).unwrap_or(1)
    }

    fn tail_hash(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.entry_hash.as_str())
            .unwrap_or(GENESIS_HASH)
    }
}

/// Append-only, hash-chained audit log.
pub struct AuditLog {
    chain: Mutex<ChainTail>,
    store: Option<JsonlStore<AuditEntry>>,
}

impl AuditLog {
    /// Create an empty log held only in memory.
    pub fn in_memory() -> Self {
        Self {
            chain: Mutex::new(ChainTail { entries: Vec::new() }),
            store: None,
        }
    }

    /// Open a persisted log, continuing from its last entry.
    ///
    /// Opening does not verify the chain; call [`AuditLog::verify_chain`].
    pub fn open(path: impl AsRef<Path>) -> RelayResult<Self> {
        let (store, entries) = JsonlStore::open(path)?;
        info!(entries = entries.len(), "audit_log_loaded");
        Ok(Self {
            chain: Mutex::new(ChainTail { entries }),
            store: Some(store),
        })
    }

    /// Append an entry after the current tail.
    ///
    /// The entry is persisted before it becomes visible; a failed write
    /// leaves the chain unchanged.
    pub fn append(
        &self,
        actor: &str,
        action: AuditAction,
        payload_digest: &str,
    ) -> RelayResult<AuditEntry> {
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = AuditEntry::chained(
            chain.next_sequence(),
            Utc::now(),
            actor,
            action.as_str(),
            payload_digest,
            chain.tail_hash(),
        );

        if let Some(store) = &self.store {
            store.append(&entry)?;
        }

        info!(
            sequence_no = entry.sequence_no,
            actor = %entry.actor,
            action = %entry.action,
            "audit_entry_appended"
        );

        chain.entries.push(entry.clone());
        Ok(entry)
    }

    /// Snapshot of every entry in sequence order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Whether any entry carries `payload_digest`.
    pub fn contains_digest(&self, payload_digest: &str) -> bool {
        self.chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .any(|e| e.payload_digest == payload_digest)
    }

    pub fn len(&self) -> usize {
        self.chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify the whole chain from genesis.
    ///
    /// Returns the number of entries checked, or `ChainIntegrity` naming the
    /// first broken sequence number.
    pub fn verify_chain(&self) -> RelayResult<usize> {
        let entries = self.entries();
        match verify_entries(&entries) {
            Ok(count) => {
                info!(entries = count, "audit_chain_verified");
                Ok(count)
            }
            Err(ChainBreak { sequence_no, reason }) => {
                error!(sequence_no, reason = %reason, "audit_chain_broken");
                Err(RelayError::ChainIntegrity { sequence_no, reason })
            }
        }
    }
}
