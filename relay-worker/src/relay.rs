//! The relay facade.
//!
//! Wires registry, ledger, scheduler, audit log and the delivery context
//! together and exposes the operations outer layers call. Every mutating
//! call takes the acting principal and leaves an audit entry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalGate, ApprovalToken};
use crate::audit::{payload_digest, AuditAction, AuditEntry, AuditLog};
use crate::config::Config;
use crate::delivery::{
    deliver_test, exhaustion_digest, DeliveryContext, HttpTransport, RetryPolicy, Transport,
    WorkerPool, WORKER_ACTOR,
};
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, RelayResult};
use crate::event::{Event, EventType};
use crate::ledger::{DeliveryAttempt, DeliveryLedger};
use crate::registry::{
    ListFilter, RegisterRequest, SubscriptionStatus, SubscriptionView, Transition,
    WebhookRegistry, WebhookSubscription,
};
use crate::scheduler::RetryScheduler;
use crate::storage::{off_runtime, AUDIT_FILE, DELIVERIES_FILE, SUBSCRIPTIONS_FILE};
use crate::throttle::{HostTokenBucket, NoThrottle, Throttle};

/// Source name stamped on events the relay creates itself.
pub const RELAY_SOURCE: &str = "hookwire";

const PURGE_ACTION: &str = "purge_webhook";

/// Result of `register`. The secret is returned here and nowhere else.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub subscription: SubscriptionView,
    pub secret: String,
}

fn subscription_digest(sub: &WebhookSubscription) -> String {
    let parts = sub.audit_parts();
    let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
    payload_digest(&slices)
}

/// Builds a [`Relay`], optionally with injected transport and throttle.
pub struct RelayBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    throttle: Option<Arc<dyn Throttle>>,
}

impl RelayBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            throttle: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Open the stores (persisted when `data_dir` is set) and re-queue any
    /// attempt left unfinished by a previous run.
    pub fn build(self) -> RelayResult<Relay> {
        let config = self.config.normalized();

        let (registry, ledger, audit) = match &config.data_dir {
            Some(dir) => (
                WebhookRegistry::open(dir.join(SUBSCRIPTIONS_FILE), config.allow_insecure_urls)?,
                DeliveryLedger::open(dir.join(DELIVERIES_FILE), config.max_attempts)?,
                AuditLog::open(dir.join(AUDIT_FILE))?,
            ),
            None => (
                WebhookRegistry::new(config.allow_insecure_urls),
                DeliveryLedger::new(config.max_attempts),
                AuditLog::in_memory(),
            ),
        };
        let registry = Arc::new(registry);
        let ledger = Arc::new(ledger);
        let audit = Arc::new(audit);
        let scheduler = Arc::new(RetryScheduler::new());

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let throttle: Arc<dyn Throttle> = match (self.throttle, config.throttle_per_host_rps) {
            (Some(throttle), _) => throttle,
            (None, Some(rps)) => Arc::new(HostTokenBucket::new(rps, rps.ceil() as u32)),
            (None, None) => Arc::new(NoThrottle),
        };

        let recovered = ledger.recover(Utc::now())?;
        for attempt in &recovered {
            scheduler.schedule(attempt.id, attempt.attempt_number, attempt.not_before);
        }
        let restored = restore_exhaustion_audit(&ledger, &audit)?;

        let delivery = Arc::new(DeliveryContext {
            registry: Arc::clone(&registry),
            ledger: Arc::clone(&ledger),
            scheduler: Arc::clone(&scheduler),
            audit: Arc::clone(&audit),
            transport,
            throttle,
            policy: RetryPolicy::from_config(&config),
        });

        info!(
            persistent = config.data_dir.is_some(),
            subscriptions = registry.len(),
            attempts = ledger.len(),
            audit_entries = audit.len(),
            requeued = recovered.len(),
            restored_audit_entries = restored,
            "relay_ready"
        );

        Ok(Relay {
            dispatcher: Dispatcher::new(
                Arc::clone(&registry),
                Arc::clone(&ledger),
                Arc::clone(&scheduler),
            ),
            approvals: ApprovalGate::new(Duration::from_secs(config.approval_ttl_secs)),
            config,
            registry,
            ledger,
            scheduler,
            audit,
            delivery,
        })
    }
}

/// Append the `delivery_exhausted` entry of every exhausted chain that has
/// none, e.g. when the process stopped between the two writes.
fn restore_exhaustion_audit(ledger: &DeliveryLedger, audit: &AuditLog) -> RelayResult<usize> {
    let exhausted = AuditAction::DeliveryExhausted.as_str();
    let recorded: HashSet<String> = audit
        .entries()
        .into_iter()
        .filter(|e| e.action == exhausted)
        .map(|e| e.payload_digest)
        .collect();

    let mut restored = 0;
    for row in ledger.exhausted() {
        let digest = exhaustion_digest(&row);
        if recorded.contains(&digest) {
            continue;
        }
        audit.append(WORKER_ACTOR, AuditAction::DeliveryExhausted, &digest)?;
        warn!(
            attempt_id = %row.id,
            webhook_id = %row.webhook_id,
            "delivery_exhausted_audit_restored"
        );
        restored += 1;
    }
    Ok(restored)
}

/// Event notification and audit relay.
pub struct Relay {
    config: Config,
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    scheduler: Arc<RetryScheduler>,
    audit: Arc<AuditLog>,
    dispatcher: Dispatcher,
    approvals: ApprovalGate,
    delivery: Arc<DeliveryContext>,
}

impl Relay {
    /// Build a relay with the default HTTP transport.
    pub fn new(config: Config) -> RelayResult<Self> {
        RelayBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the worker pool and lease reaper.
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(
            Arc::clone(&self.delivery),
            self.config.worker_concurrency,
            self.config.reaper_interval(),
        )
    }

    /// Attempts queued in the scheduler, due or not.
    pub fn queued(&self) -> usize {
        self.scheduler.len()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Fan an event out to its subscribers. Returns the first attempts
    /// created; delivery happens on the worker pool.
    pub fn emit(&self, event: Event) -> RelayResult<Vec<DeliveryAttempt>> {
        self.dispatcher.emit(event)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// The audit entry is written before the subscription goes live, so a
    /// failed append leaves nothing registered.
    pub fn register(&self, actor: &str, request: RegisterRequest) -> RelayResult<Registration> {
        let sub = self.registry.prepare(request)?;
        self.audit
            .append(actor, AuditAction::WebhookRegistered, &subscription_digest(&sub))?;
        let sub = self.registry.insert(sub)?;
        Ok(Registration {
            subscription: SubscriptionView::from(sub.as_ref()),
            secret: sub.secret.reveal(),
        })
    }

    pub fn get(&self, id: Uuid) -> RelayResult<SubscriptionView> {
        Ok(SubscriptionView::from(self.registry.get(id)?.as_ref()))
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<SubscriptionView> {
        self.registry
            .list(filter)
            .iter()
            .map(|s| SubscriptionView::from(s.as_ref()))
            .collect()
    }

    /// Audit a status change. A repeated call that finds its state already
    /// committed but never audited writes the missing entry.
    fn audit_transition(
        &self,
        actor: &str,
        action: AuditAction,
        transition: &Transition,
    ) -> RelayResult<()> {
        let digest = subscription_digest(&transition.subscription);
        if transition.changed || !self.audit.contains_digest(&digest) {
            self.audit.append(actor, action, &digest)?;
        }
        Ok(())
    }

    pub fn enable(&self, actor: &str, id: Uuid) -> RelayResult<SubscriptionView> {
        let transition = self.registry.enable(id)?;
        self.audit_transition(actor, AuditAction::WebhookEnabled, &transition)?;
        Ok(SubscriptionView::from(transition.subscription.as_ref()))
    }

    /// Attempts already queued are cancelled when a worker claims them.
    pub fn disable(&self, actor: &str, id: Uuid) -> RelayResult<SubscriptionView> {
        let transition = self.registry.disable(id)?;
        self.audit_transition(actor, AuditAction::WebhookDisabled, &transition)?;
        Ok(SubscriptionView::from(transition.subscription.as_ref()))
    }

    /// Tombstone a subscription and cancel its pending attempts. Deleting a
    /// tombstone again repeats the cancellation.
    pub fn delete(&self, actor: &str, id: Uuid) -> RelayResult<SubscriptionView> {
        let transition = self.registry.delete(id)?;
        let cancelled = self.ledger.cancel_pending(id)?;
        let ids: HashSet<Uuid> = cancelled.into_iter().collect();
        self.scheduler.remove(&ids);
        self.audit_transition(actor, AuditAction::WebhookDeleted, &transition)?;
        Ok(SubscriptionView::from(transition.subscription.as_ref()))
    }

    /// Deliver a `system.test` event right away and record it as a test
    /// attempt. Never retried.
    pub async fn test(&self, actor: &str, id: Uuid) -> RelayResult<DeliveryAttempt> {
        let sub = self.registry.get(id)?;
        if sub.status == SubscriptionStatus::Deleted {
            return Err(RelayError::Validation(format!("subscription {id} is deleted")));
        }

        let event = Event::new(
            EventType::SystemTest,
            json!({ "webhook_id": id, "message": "test delivery" }),
            RELAY_SOURCE,
        );
        let attempt = deliver_test(&self.delivery, &sub, Arc::new(event)).await?;

        let audit = Arc::clone(&self.audit);
        let actor = actor.to_string();
        let digest = payload_digest(&[
            attempt.id.as_bytes(),
            sub.id.as_bytes(),
            attempt.status.as_str().as_bytes(),
        ]);
        off_runtime(move || audit.append(&actor, AuditAction::WebhookTested, &digest)).await?;
        Ok(attempt)
    }

    // =========================================================================
    // Delivery history
    // =========================================================================

    pub fn history(&self, webhook_id: Uuid) -> RelayResult<Vec<DeliveryAttempt>> {
        self.registry.get(webhook_id)?;
        Ok(self.ledger.history(webhook_id))
    }

    pub fn delivery(&self, delivery_id: Uuid) -> RelayResult<DeliveryAttempt> {
        self.ledger.get(delivery_id)
    }

    /// Re-queue an `exhausted` or `failed_permanent` attempt as a fresh chain.
    pub fn retry(&self, actor: &str, delivery_id: Uuid) -> RelayResult<DeliveryAttempt> {
        let previous = self.ledger.get(delivery_id)?;
        let sub = self.registry.get(previous.webhook_id)?;
        if sub.status == SubscriptionStatus::Deleted {
            return Err(RelayError::Validation(format!(
                "subscription {} is deleted",
                sub.id
            )));
        }

        let fresh = self.ledger.restart_chain(delivery_id, Utc::now())?;
        self.scheduler
            .schedule(fresh.id, fresh.attempt_number, fresh.not_before);

        self.audit.append(
            actor,
            AuditAction::DeliveryManualRetry,
            &payload_digest(&[
                previous.id.as_bytes(),
                fresh.id.as_bytes(),
                fresh.event_id.as_bytes(),
                fresh.webhook_id.as_bytes(),
            ]),
        )?;
        info!(
            previous_attempt_id = %previous.id,
            attempt_id = %fresh.id,
            webhook_id = %fresh.webhook_id,
            "delivery_manual_retry"
        );
        Ok(fresh)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Verify the audit chain end to end. `ChainIntegrity` means the log can
    /// no longer be trusted; callers must stop, not continue.
    pub fn verify_audit_chain(&self) -> RelayResult<usize> {
        self.audit.verify_chain()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    // =========================================================================
    // Approved purge
    // =========================================================================

    fn purge_plan(sub: &WebhookSubscription) -> serde_json::Value {
        json!({
            "action": PURGE_ACTION,
            "webhook_id": sub.id,
            "url": sub.url,
            "status": sub.status.as_str(),
            "version": sub.version,
        })
    }

    /// Propose deleting a subscription. Any change to the subscription
    /// before execution invalidates the token.
    pub fn propose_purge(&self, actor: &str, webhook_id: Uuid) -> RelayResult<ApprovalToken> {
        let sub = self.registry.get(webhook_id)?;
        let token = self
            .approvals
            .propose(PURGE_ACTION, &Self::purge_plan(&sub), Utc::now());

        self.audit.append(
            actor,
            AuditAction::ApprovalProposed,
            &payload_digest(&[token.token.as_bytes(), token.plan_hash.as_bytes()]),
        )?;
        Ok(token)
    }

    /// Execute an approved purge.
    pub fn execute_purge(
        &self,
        actor: &str,
        token: Uuid,
        webhook_id: Uuid,
    ) -> RelayResult<SubscriptionView> {
        let sub = self.registry.get(webhook_id)?;
        let plan_hash = self
            .approvals
            .consume(token, PURGE_ACTION, &Self::purge_plan(&sub), Utc::now())?;

        self.audit.append(
            actor,
            AuditAction::ApprovalConsumed,
            &payload_digest(&[token.as_bytes(), plan_hash.as_bytes()]),
        )?;
        self.delete(actor, webhook_id)
    }
}
