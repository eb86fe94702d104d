//! Delivery workers.
//!
//! Each worker pops the earliest due attempt, claims it through the ledger
//! lease, sends it, and records the outcome. Failed tries that may be retried
//! produce the next pending row and put it back on the scheduler. A separate
//! reaper returns attempts whose lease expired to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::audit::{payload_digest, AuditAction, AuditLog};
use crate::config::Config;
use crate::delivery::backoff::{backoff_delay, parse_retry_after};
use crate::delivery::transport::{OutboundRequest, Transport, TransportResponse};
use crate::error::{DeliveryError, RelayResult, StoreError};
use crate::event::{canonical_envelope, Event};
use crate::ledger::{AttemptOutcome, AttemptStatus, DeliveryAttempt, DeliveryLedger, FailureReason};
use crate::registry::{WebhookRegistry, WebhookSubscription};
use crate::scheduler::RetryScheduler;
use crate::signer::{sign, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use crate::storage::off_runtime;
use crate::throttle::Throttle;

/// Actor recorded on audit entries written by workers.
pub const WORKER_ACTOR: &str = "delivery-worker";

/// Upper bound on how long an idle worker sleeps before re-checking the queue.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Retry and timing knobs for delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
    pub request_timeout: Duration,
    pub lease_ttl: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay(),
            jitter: config.retry_jitter(),
            request_timeout: config.request_timeout(),
            lease_ttl: config.lease_ttl(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything a worker touches.
pub struct DeliveryContext {
    pub registry: Arc<WebhookRegistry>,
    pub ledger: Arc<DeliveryLedger>,
    pub scheduler: Arc<RetryScheduler>,
    pub audit: Arc<AuditLog>,
    pub transport: Arc<dyn Transport>,
    pub throttle: Arc<dyn Throttle>,
    pub policy: RetryPolicy,
}

/// Map a send result to the attempt's outcome.
///
/// `attempt_number` is the number of the attempt that was just sent.
pub fn decide_outcome<R: Rng + ?Sized>(
    result: &Result<TransportResponse, DeliveryError>,
    attempt_number: u32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    rng: &mut R,
) -> AttemptOutcome {
    let failure = match result {
        Ok(resp) if (200..300).contains(&resp.status) => {
            return AttemptOutcome::Success {
                response_code: resp.status,
            }
        }
        Ok(resp) => DeliveryError::HttpStatus(resp.status),
        Err(err) => err.clone(),
    };
    let reason = FailureReason::from(&failure);

    let (response_code, retry_after) = match (&failure, result) {
        (DeliveryError::HttpStatus(429), Ok(resp)) => (
            Some(429),
            resp.retry_after
                .as_deref()
                .and_then(|v| parse_retry_after(v, now)),
        ),
        // redirects are not followed, so a 3xx is as final as a 4xx
        (DeliveryError::HttpStatus(code @ 300..=499), _) => {
            return AttemptOutcome::FailedPermanent {
                response_code: Some(*code),
                reason,
            }
        }
        (DeliveryError::HttpStatus(code), _) => (Some(*code), None),
        _ => (None, None),
    };

    if attempt_number >= policy.max_attempts {
        return AttemptOutcome::Exhausted {
            response_code,
            reason,
        };
    }

    let delay = retry_after
        .unwrap_or_else(|| backoff_delay(policy.base_delay, policy.jitter, attempt_number, rng));
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));

    AttemptOutcome::ScheduledRetry {
        response_code,
        reason,
        next_retry_at: now + delay,
    }
}

/// Outcome of a test send. Tests never retry.
pub fn decide_test_outcome(result: &Result<TransportResponse, DeliveryError>) -> AttemptOutcome {
    let failure = match result {
        Ok(resp) if (200..300).contains(&resp.status) => {
            return AttemptOutcome::Success {
                response_code: resp.status,
            }
        }
        Ok(resp) => DeliveryError::HttpStatus(resp.status),
        Err(err) => err.clone(),
    };

    AttemptOutcome::FailedPermanent {
        response_code: match failure {
            DeliveryError::HttpStatus(code) => Some(code),
            _ => None,
        },
        reason: FailureReason::from(&failure),
    }
}

/// Canonical body plus signature headers for one attempt.
pub fn build_request(
    subscription: &WebhookSubscription,
    event: &Event,
    attempt_id: Uuid,
    timeout: Duration,
) -> RelayResult<OutboundRequest> {
    let body = canonical_envelope(event).map_err(StoreError::from)?;
    let signature = sign(subscription.secret.expose(), &body);

    Ok(OutboundRequest {
        url: subscription.url.clone(),
        headers: vec![
            (SIGNATURE_HEADER.to_string(), signature),
            (EVENT_HEADER.to_string(), event.event_type.to_string()),
            (DELIVERY_HEADER.to_string(), attempt_id.to_string()),
        ],
        body,
        timeout,
    })
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Send with the request timeout enforced here as well as in the transport,
/// so a send never outlives the lease taken for it.
async fn send(ctx: &DeliveryContext, request: OutboundRequest) -> Result<TransportResponse, DeliveryError> {
    let timeout = request.timeout;
    match tokio::time::timeout(timeout, ctx.transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout),
    }
}

/// Wait for the throttle of the host an attempt is headed to. Runs before
/// the lease is taken so throttle waits never eat into it.
async fn throttle_for(ctx: &DeliveryContext, attempt_id: Uuid) {
    let host = ctx
        .ledger
        .get(attempt_id)
        .ok()
        .filter(|row| row.status == AttemptStatus::Pending)
        .and_then(|row| ctx.registry.get(row.webhook_id).ok())
        .filter(|sub| sub.is_active())
        .map(|sub| host_of(&sub.url));

    if let Some(host) = host {
        ctx.throttle.acquire(&host).await;
    }
}

/// Audit digest of an exhausted chain's final row.
pub fn exhaustion_digest(row: &DeliveryAttempt) -> String {
    payload_digest(&[
        row.id.as_bytes(),
        row.event_id.as_bytes(),
        row.webhook_id.as_bytes(),
        &row.attempt_number.to_be_bytes(),
    ])
}

/// Apply a leased attempt's outcome and do what follows from it: queue the
/// next try, or audit an exhausted chain. Returns `None` when the lease was
/// lost and the outcome discarded.
fn record_outcome(
    ctx: &DeliveryContext,
    attempt_id: Uuid,
    token: Uuid,
    sent_at: Option<DateTime<Utc>>,
    outcome: AttemptOutcome,
) -> RelayResult<Option<DeliveryAttempt>> {
    let Some(finished) = ctx.ledger.finish(attempt_id, token, sent_at, outcome)? else {
        return Ok(None);
    };

    match finished.status {
        AttemptStatus::Success => {
            info!(
                attempt_id = %attempt_id,
                webhook_id = %finished.webhook_id,
                status_code = ?finished.response_code,
                "delivery_succeeded"
            );
        }
        AttemptStatus::FailedPermanent => {
            warn!(
                attempt_id = %attempt_id,
                webhook_id = %finished.webhook_id,
                status_code = ?finished.response_code,
                reason = ?finished.reason,
                "delivery_failed_permanent"
            );
        }
        AttemptStatus::ScheduledRetry => {
            let next = ctx.ledger.schedule_retry(&finished)?;
            ctx.scheduler
                .schedule(next.id, next.attempt_number, next.not_before);
            warn!(
                attempt_id = %attempt_id,
                webhook_id = %finished.webhook_id,
                attempt_number = finished.attempt_number,
                reason = ?finished.reason,
                next_retry_at = %next.not_before,
                "delivery_retry_scheduled"
            );
        }
        AttemptStatus::Exhausted => {
            // audit only; exhaustion never emits an event of its own
            ctx.audit.append(
                WORKER_ACTOR,
                AuditAction::DeliveryExhausted,
                &exhaustion_digest(&finished),
            )?;
            error!(
                attempt_id = %attempt_id,
                webhook_id = %finished.webhook_id,
                event_id = %finished.event_id,
                attempt_number = finished.attempt_number,
                reason = ?finished.reason,
                "delivery_exhausted"
            );
        }
        AttemptStatus::Pending | AttemptStatus::InFlight => {}
    }

    Ok(Some(finished))
}

/// Claim and run one attempt.
///
/// Returns `None` when the attempt was not ours to run (already claimed or
/// no longer pending) or when our lease was lost before the result landed.
/// The lease only has to cover the send itself.
pub async fn execute_attempt(
    ctx: &Arc<DeliveryContext>,
    attempt_id: Uuid,
    owner: &str,
) -> RelayResult<Option<DeliveryAttempt>> {
    throttle_for(ctx, attempt_id).await;

    let claimed = {
        let ctx = Arc::clone(ctx);
        let owner = owner.to_string();
        off_runtime(move || {
            ctx.ledger
                .lease(attempt_id, &owner, ctx.policy.lease_ttl, Utc::now())
        })
        .await?
    };
    let Some(claimed) = claimed else {
        return Ok(None);
    };
    let (token, lease_expires_at) = match &claimed.lease {
        Some(lease) => (lease.token, lease.expires_at),
        None => return Ok(None),
    };

    info!(
        attempt_id = %attempt_id,
        webhook_id = %claimed.webhook_id,
        event_id = %claimed.event_id,
        attempt_number = claimed.attempt_number,
        worker = owner,
        "delivery_attempt_claimed"
    );

    let subscription = ctx
        .registry
        .get(claimed.webhook_id)
        .ok()
        .filter(|s| s.is_active());
    let event = ctx.ledger.event_for(claimed.chain_id);

    let (sent_at, outcome) = match (subscription, event) {
        (None, _) => {
            info!(attempt_id = %attempt_id, webhook_id = %claimed.webhook_id, "delivery_cancelled_inactive");
            (
                None,
                AttemptOutcome::FailedPermanent {
                    response_code: None,
                    reason: FailureReason::SubscriptionInactive,
                },
            )
        }
        (Some(_), None) => {
            error!(attempt_id = %attempt_id, chain_id = %claimed.chain_id, "delivery_event_missing");
            (
                None,
                AttemptOutcome::FailedPermanent {
                    response_code: None,
                    reason: FailureReason::EventMissing,
                },
            )
        }
        (Some(subscription), Some(event)) => {
            let sent_at = Utc::now();
            let lease_left = (lease_expires_at - sent_at).to_std().unwrap_or(Duration::ZERO);
            let timeout = ctx.policy.request_timeout.min(lease_left);
            let request = build_request(&subscription, &event, attempt_id, timeout)?;
            let result = send(ctx, request).await;

            let outcome = decide_outcome(
                &result,
                claimed.attempt_number,
                &ctx.policy,
                Utc::now(),
                &mut rand::thread_rng(),
            );
            (Some(sent_at), outcome)
        }
    };

    let ctx = Arc::clone(ctx);
    off_runtime(move || record_outcome(&ctx, attempt_id, token, sent_at, outcome)).await
}

/// Send a test event right away, bypassing the queue.
pub async fn deliver_test(
    ctx: &Arc<DeliveryContext>,
    subscription: &WebhookSubscription,
    event: Arc<Event>,
) -> RelayResult<DeliveryAttempt> {
    let attempt_id = Uuid::new_v4();
    let request = build_request(subscription, &event, attempt_id, ctx.policy.request_timeout)?;

    ctx.throttle.acquire(&host_of(&subscription.url)).await;
    let sent_at = Utc::now();
    let result = send(ctx, request).await;
    let outcome = decide_test_outcome(&result);

    let ledger = Arc::clone(&ctx.ledger);
    let webhook_id = subscription.id;
    let attempt = off_runtime(move || {
        ledger.record_test(attempt_id, event, webhook_id, sent_at, outcome)
    })
    .await?;
    info!(
        attempt_id = %attempt.id,
        webhook_id = %subscription.id,
        status = attempt.status.as_str(),
        status_code = ?attempt.response_code,
        "webhook_test_delivered"
    );
    Ok(attempt)
}

/// Return expired leases to the queue. Returns how many were reclaimed.
pub fn reap_expired(ctx: &DeliveryContext, now: DateTime<Utc>) -> RelayResult<usize> {
    let reclaimed = ctx.ledger.expire_leases(now)?;
    for row in &reclaimed {
        ctx.scheduler
            .schedule(row.id, row.attempt_number, row.not_before);
    }
    Ok(reclaimed.len())
}

async fn run_worker(ctx: Arc<DeliveryContext>, name: String, mut shutdown: watch::Receiver<bool>) {
    info!(worker = %name, "delivery_worker_started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.scheduler.pop_due(Utc::now()) {
            Some(attempt_id) => {
                if let Err(e) = execute_attempt(&ctx, attempt_id, &name).await {
                    error!(worker = %name, attempt_id = %attempt_id, error = %e, "delivery_attempt_error");
                }
            }
            None => {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ctx.scheduler.wait_for_work(IDLE_POLL) => {}
                }
            }
        }
    }

    info!(worker = %name, "delivery_worker_stopped");
}

async fn run_reaper(ctx: Arc<DeliveryContext>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaper_ctx = Arc::clone(&ctx);
                match off_runtime(move || reap_expired(&reaper_ctx, Utc::now())).await {
                    Ok(0) => {}
                    Ok(n) => warn!(reclaimed = n, "lease_reaper_reclaimed"),
                    Err(e) => error!(error = %e, "lease_reaper_failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Fixed-size pool of delivery workers plus the lease reaper.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    scheduler: Arc<RetryScheduler>,
}

impl WorkerPool {
    pub fn start(ctx: Arc<DeliveryContext>, workers: usize, reaper_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = workers.max(1);

        let mut handles = Vec::with_capacity(workers + 1);
        for i in 0..workers {
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&ctx),
                format!("worker-{i}"),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(run_reaper(
            Arc::clone(&ctx),
            reaper_interval,
            shutdown_rx,
        )));

        info!(workers, reaper_interval_ms = reaper_interval.as_millis() as u64, "worker_pool_started");

        Self {
            shutdown_tx,
            handles,
            scheduler: Arc::clone(&ctx.scheduler),
        }
    }

    /// Stop taking new attempts and wait for in-progress sends to finish.
    pub async fn shutdown(self) {
        info!("worker_pool_stopping");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.wake_all();

        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker_task_failed");
            }
        }
        info!("worker_pool_stopped");
    }
}
