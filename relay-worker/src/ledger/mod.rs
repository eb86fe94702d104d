//! Delivery ledger: the history of every attempt per (event, subscription).
//!
//! Each row is guarded by the map's entry lock, so the `pending -> in_flight`
//! claim is a compare-and-swap on the row itself. A worker's report is only
//! accepted while its lease token still matches the row.

pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::event::Event;
use crate::storage::JsonlStore;

pub use types::{
    AttemptKind, AttemptOutcome, AttemptStatus, DeliveryAttempt, FailureReason, Lease,
    LedgerRecord,
};

/// Attempt history, keyed by attempt id.
pub struct DeliveryLedger {
    attempts: DashMap<Uuid, DeliveryAttempt>,
    chains: DashMap<Uuid, Arc<Event>>,
    slots: DashMap<(Uuid, u32), Uuid>,
    by_webhook: DashMap<Uuid, Vec<Uuid>>,
    store: Option<JsonlStore<LedgerRecord>>,
    max_attempts: u32,
}

impl DeliveryLedger {
    /// Create an empty in-memory ledger.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: DashMap::new(),
            chains: DashMap::new(),
            slots: DashMap::new(),
            by_webhook: DashMap::new(),
            store: None,
            max_attempts,
        }
    }

    /// Open a persisted ledger, replaying every record in order.
    pub fn open(path: impl AsRef<Path>, max_attempts: u32) -> RelayResult<Self> {
        let (store, records) = JsonlStore::<LedgerRecord>::open(path)?;
        let mut ledger = Self::new(max_attempts);

        for record in records {
            match record {
                LedgerRecord::Chain { chain_id, event } => {
                    ledger.chains.insert(chain_id, Arc::new(event));
                }
                LedgerRecord::Attempt(attempt) => ledger.index(attempt),
            }
        }

        info!(
            attempts = ledger.attempts.len(),
            chains = ledger.chains.len(),
            "ledger_loaded"
        );

        ledger.store = Some(store);
        Ok(ledger)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn index(&self, attempt: DeliveryAttempt) {
        self.slots
            .insert((attempt.chain_id, attempt.attempt_number), attempt.id);
        if !self.attempts.contains_key(&attempt.id) {
            self.by_webhook
                .entry(attempt.webhook_id)
                .or_default()
                .push(attempt.id);
        }
        self.attempts.insert(attempt.id, attempt);
    }

    fn persist(&self, record: &LedgerRecord) -> RelayResult<()> {
        if let Some(store) = &self.store {
            store.append(record)?;
        }
        Ok(())
    }

    fn persist_attempt(&self, attempt: &DeliveryAttempt) -> RelayResult<()> {
        self.persist(&LedgerRecord::Attempt(attempt.clone()))
    }

    /// Insert a new row. Rejects a second row for the same (chain, attempt
    /// number) and attempt numbers outside `1..=max_attempts`.
    fn insert(&self, attempt: DeliveryAttempt) -> RelayResult<DeliveryAttempt> {
        if attempt.attempt_number == 0 || attempt.attempt_number > self.max_attempts {
            return Err(RelayError::Validation(format!(
                "attempt number {} outside 1..={}",
                attempt.attempt_number, self.max_attempts
            )));
        }

        match self.slots.entry((attempt.chain_id, attempt.attempt_number)) {
            Entry::Occupied(_) => {
                return Err(RelayError::Validation(format!(
                    "attempt {} of chain {} already exists",
                    attempt.attempt_number, attempt.chain_id
                )))
            }
            Entry::Vacant(slot) => {
                self.persist_attempt(&attempt)?;
                slot.insert(attempt.id);
            }
        }

        self.by_webhook
            .entry(attempt.webhook_id)
            .or_default()
            .push(attempt.id);
        self.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    fn new_row(
        chain_id: Uuid,
        event_id: &str,
        webhook_id: Uuid,
        attempt_number: u32,
        kind: AttemptKind,
        not_before: DateTime<Utc>,
    ) -> DeliveryAttempt {
        let now = Utc::now();
        DeliveryAttempt {
            id: Uuid::new_v4(),
            chain_id,
            event_id: event_id.to_string(),
            webhook_id,
            attempt_number,
            kind,
            status: AttemptStatus::Pending,
            sent_at: None,
            response_code: None,
            next_retry_at: None,
            reason: None,
            lease: None,
            not_before,
            created_at: now,
            updated_at: now,
        }
    }

    /// Start a chain for `event` towards `webhook_id` with a pending first
    /// attempt due at `not_before`.
    pub fn open_chain(
        &self,
        event: Arc<Event>,
        webhook_id: Uuid,
        kind: AttemptKind,
        not_before: DateTime<Utc>,
    ) -> RelayResult<DeliveryAttempt> {
        let chain_id = Uuid::new_v4();
        self.persist(&LedgerRecord::Chain {
            chain_id,
            event: event.as_ref().clone(),
        })?;
        let row = Self::new_row(chain_id, &event.id, webhook_id, 1, kind, not_before);
        self.chains.insert(chain_id, event);
        self.insert(row)
    }

    /// Record a synchronous test delivery as a finished single-attempt chain.
    /// `attempt_id` is the id already sent in the delivery header.
    pub fn record_test(
        &self,
        attempt_id: Uuid,
        event: Arc<Event>,
        webhook_id: Uuid,
        sent_at: DateTime<Utc>,
        outcome: AttemptOutcome,
    ) -> RelayResult<DeliveryAttempt> {
        let chain_id = Uuid::new_v4();
        self.persist(&LedgerRecord::Chain {
            chain_id,
            event: event.as_ref().clone(),
        })?;
        let mut row = Self::new_row(chain_id, &event.id, webhook_id, 1, AttemptKind::Test, sent_at);
        row.id = attempt_id;
        apply_outcome(&mut row, Some(sent_at), &outcome);
        self.chains.insert(chain_id, event);
        self.insert(row)
    }

    /// Event delivered by a chain.
    pub fn event_for(&self, chain_id: Uuid) -> Option<Arc<Event>> {
        self.chains.get(&chain_id).map(|e| Arc::clone(e.value()))
    }

    pub fn get(&self, id: Uuid) -> RelayResult<DeliveryAttempt> {
        self.attempts
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or_else(|| RelayError::not_found("delivery", id))
    }

    /// Every attempt made towards a subscription, oldest first. Tombstoned
    /// subscriptions keep their history.
    pub fn history(&self, webhook_id: Uuid) -> Vec<DeliveryAttempt> {
        let ids = self
            .by_webhook
            .get(&webhook_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut rows: Vec<DeliveryAttempt> = ids
            .iter()
            .filter_map(|id| self.attempts.get(id).map(|a| a.value().clone()))
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        rows
    }

    /// Claim a pending attempt: `pending -> in_flight` with a fresh lease.
    ///
    /// Returns `None` when the row is no longer pending (already claimed,
    /// cancelled or finished).
    pub fn lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> RelayResult<Option<DeliveryAttempt>> {
        let mut row = self
            .attempts
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found("delivery", id))?;

        if row.status != AttemptStatus::Pending {
            debug!(attempt_id = %id, status = row.status.as_str(), "delivery_lease_skipped");
            return Ok(None);
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut next = row.clone();
        next.status = AttemptStatus::InFlight;
        next.lease = Some(Lease {
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        });
        next.updated_at = now;

        self.persist_attempt(&next)?;
        *row = next.clone();
        Ok(Some(next))
    }

    /// Apply a worker's outcome if its lease is still the current one.
    ///
    /// Returns `None` when the lease was lost (expired and reclaimed); the
    /// late result is discarded.
    pub fn finish(
        &self,
        id: Uuid,
        lease_token: Uuid,
        sent_at: Option<DateTime<Utc>>,
        outcome: AttemptOutcome,
    ) -> RelayResult<Option<DeliveryAttempt>> {
        let mut row = self
            .attempts
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found("delivery", id))?;

        let holds_lease = row.status == AttemptStatus::InFlight
            && row.lease.as_ref().map(|l| l.token) == Some(lease_token);
        if !holds_lease {
            warn!(
                attempt_id = %id,
                status = row.status.as_str(),
                "delivery_lease_lost"
            );
            return Ok(None);
        }

        let mut next = row.clone();
        apply_outcome(&mut next, sent_at, &outcome);

        self.persist_attempt(&next)?;
        *row = next.clone();
        Ok(Some(next))
    }

    /// Create the next pending attempt after a `scheduled_retry` row.
    ///
    /// `ExhaustedRetries` when `previous` already used the last attempt.
    pub fn schedule_retry(&self, previous: &DeliveryAttempt) -> RelayResult<DeliveryAttempt> {
        let due = match (previous.status, previous.next_retry_at) {
            (AttemptStatus::ScheduledRetry, Some(due)) => due,
            _ => {
                return Err(RelayError::Validation(format!(
                    "attempt {} has no scheduled retry",
                    previous.id
                )))
            }
        };
        if previous.attempt_number >= self.max_attempts {
            return Err(RelayError::ExhaustedRetries {
                attempt_id: previous.id,
            });
        }

        self.insert(Self::new_row(
            previous.chain_id,
            &previous.event_id,
            previous.webhook_id,
            previous.attempt_number + 1,
            previous.kind,
            due,
        ))
    }

    /// Start a fresh chain for a finished one (`exhausted` or
    /// `failed_permanent`).
    pub fn restart_chain(&self, id: Uuid, now: DateTime<Utc>) -> RelayResult<DeliveryAttempt> {
        let previous = self.get(id)?;
        if previous.kind == AttemptKind::Test {
            return Err(RelayError::Validation(format!(
                "delivery {id} is a test delivery and cannot be retried"
            )));
        }
        if !matches!(
            previous.status,
            AttemptStatus::Exhausted | AttemptStatus::FailedPermanent
        ) {
            return Err(RelayError::Validation(format!(
                "delivery {id} is {}, only exhausted or failed_permanent deliveries can be retried",
                previous.status.as_str()
            )));
        }

        let event = self
            .event_for(previous.chain_id)
            .ok_or_else(|| RelayError::not_found("event", &previous.event_id))?;
        self.open_chain(event, previous.webhook_id, AttemptKind::ManualRetry, now)
    }

    /// Return attempts whose lease expired to `pending`.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> RelayResult<Vec<DeliveryAttempt>> {
        let mut reclaimed = Vec::new();

        for mut row in self.attempts.iter_mut() {
            let expired = row.status == AttemptStatus::InFlight
                && row.lease.as_ref().map_or(true, |l| l.is_expired(now));
            if !expired {
                continue;
            }

            let mut next = row.clone();
            next.status = AttemptStatus::Pending;
            next.reason = Some(FailureReason::LeaseExpired);
            next.lease = None;
            next.not_before = now;
            next.updated_at = now;

            self.persist_attempt(&next)?;
            warn!(
                attempt_id = %next.id,
                attempt_number = next.attempt_number,
                "delivery_lease_expired"
            );
            *row = next.clone();
            reclaimed.push(next);
        }

        Ok(reclaimed)
    }

    /// Cancel every pending attempt of a subscription. In-flight attempts are
    /// left to finish.
    pub fn cancel_pending(&self, webhook_id: Uuid) -> RelayResult<Vec<Uuid>> {
        let ids = self
            .by_webhook
            .get(&webhook_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut cancelled = Vec::new();
        for id in ids {
            let Some(mut row) = self.attempts.get_mut(&id) else {
                continue;
            };
            if row.status != AttemptStatus::Pending {
                continue;
            }

            let mut next = row.clone();
            next.status = AttemptStatus::FailedPermanent;
            next.reason = Some(FailureReason::SubscriptionInactive);
            next.updated_at = Utc::now();

            self.persist_attempt(&next)?;
            *row = next;
            cancelled.push(id);
        }

        if !cancelled.is_empty() {
            info!(
                webhook_id = %webhook_id,
                cancelled = cancelled.len(),
                "delivery_pending_cancelled"
            );
        }
        Ok(cancelled)
    }

    /// Attempts that must be (re)queued after a restart.
    ///
    /// Rows left in flight by a previous process go back to `pending`. A
    /// `scheduled_retry` row whose successor was never written gets it now;
    /// if it already used the last attempt it is closed as `exhausted`.
    pub fn recover(&self, now: DateTime<Utc>) -> RelayResult<Vec<DeliveryAttempt>> {
        let mut open = Vec::new();
        let mut orphaned = Vec::new();

        for mut row in self.attempts.iter_mut() {
            match row.status {
                AttemptStatus::Pending => open.push(row.clone()),
                AttemptStatus::InFlight => {
                    let mut next = row.clone();
                    next.status = AttemptStatus::Pending;
                    next.reason = Some(FailureReason::LeaseExpired);
                    next.lease = None;
                    next.not_before = now;
                    next.updated_at = now;
                    self.persist_attempt(&next)?;
                    *row = next.clone();
                    open.push(next);
                }
                AttemptStatus::ScheduledRetry
                    if !self
                        .slots
                        .contains_key(&(row.chain_id, row.attempt_number + 1)) =>
                {
                    orphaned.push(row.clone());
                }
                _ => {}
            }
        }

        for row in orphaned {
            match self.schedule_retry(&row) {
                Ok(next) => {
                    warn!(
                        attempt_id = %next.id,
                        chain_id = %next.chain_id,
                        attempt_number = next.attempt_number,
                        "delivery_retry_restored"
                    );
                    open.push(next);
                }
                Err(RelayError::ExhaustedRetries { attempt_id }) => {
                    self.close_exhausted(attempt_id, now)?;
                }
                Err(e) => return Err(e),
            }
        }

        open.sort_by(|a, b| a.not_before.cmp(&b.not_before));
        Ok(open)
    }

    fn close_exhausted(&self, id: Uuid, now: DateTime<Utc>) -> RelayResult<()> {
        let Some(mut row) = self.attempts.get_mut(&id) else {
            return Ok(());
        };
        let mut next = row.clone();
        next.status = AttemptStatus::Exhausted;
        next.next_retry_at = None;
        next.updated_at = now;

        self.persist_attempt(&next)?;
        warn!(
            attempt_id = %id,
            attempt_number = next.attempt_number,
            "delivery_exhausted_on_recovery"
        );
        *row = next;
        Ok(())
    }

    /// Final rows of every exhausted chain.
    pub fn exhausted(&self) -> Vec<DeliveryAttempt> {
        self.attempts
            .iter()
            .filter(|row| row.status == AttemptStatus::Exhausted)
            .map(|row| row.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

fn apply_outcome(row: &mut DeliveryAttempt, sent_at: Option<DateTime<Utc>>, outcome: &AttemptOutcome) {
    row.status = outcome.status();
    row.sent_at = sent_at.or(row.sent_at);
    row.lease = None;
    row.updated_at = Utc::now();
    row.next_retry_at = None;

    match outcome {
        AttemptOutcome::Success { response_code } => {
            row.response_code = Some(*response_code);
            row.reason = None;
        }
        AttemptOutcome::FailedPermanent {
            response_code,
            reason,
        }
        | AttemptOutcome::Exhausted {
            response_code,
            reason,
        } => {
            row.response_code = *response_code;
            row.reason = Some(*reason);
        }
        AttemptOutcome::ScheduledRetry {
            response_code,
            reason,
            next_retry_at,
        } => {
            row.response_code = *response_code;
            row.reason = Some(*reason);
            row.next_retry_at = Some(*next_retry_at);
        }
    }
}
