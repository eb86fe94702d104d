//! Time-ordered queue of attempts waiting to run.
//!
//! A min-heap keyed by due time. Ties go to the lower attempt number, then to
//! insertion order, so first attempts of fresh events are not starved by a
//! backlog of retries that became due at the same instant.
//!
//! The queue only holds attempt ids; the ledger stays the source of truth. A
//! popped id whose row is no longer `pending` is simply skipped by the worker.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    due_at: DateTime<Utc>,
    attempt_number: u32,
    seq: u64,
    attempt_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.attempt_number.cmp(&self.attempt_number))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delay queue shared by every worker.
pub struct RetryScheduler {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    notify: Notify,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Queue an attempt to run at `due_at` and wake one idle worker.
    pub fn schedule(&self, attempt_id: Uuid, attempt_number: u32, due_at: DateTime<Utc>) {
        let entry = QueueEntry {
            due_at,
            attempt_number,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            attempt_id,
        };
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);

        debug!(attempt_id = %attempt_id, attempt_number, due_at = %due_at, "delivery_scheduled");
        self.notify.notify_one();
    }

    /// Pop the earliest attempt if it is due at `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        match heap.peek() {
            Some(top) if top.due_at <= now => heap.pop().map(|e| e.attempt_id),
            _ => None,
        }
    }

    /// Due time of the earliest queued attempt.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek()
            .map(|e| e.due_at)
    }

    /// Drop queued entries for the given attempts. Returns how many were
    /// removed.
    pub fn remove(&self, attempt_ids: &HashSet<Uuid>) -> usize {
        if attempt_ids.is_empty() {
            return 0;
        }
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let before = heap.len();
        heap.retain(|e| !attempt_ids.contains(&e.attempt_id));
        before - heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep until the earliest entry is due, something new is scheduled, or
    /// `max_wait` elapses, whichever comes first.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let wait = match self.next_due() {
            Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => max_wait,
        }
        .min(max_wait);

        if wait.is_zero() {
            return;
        }

        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Wake every idle worker, e.g. on shutdown.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
