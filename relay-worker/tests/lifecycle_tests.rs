//! Subscription lifecycle: cancellation, audit trail and approved purge.

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use hookwire::{
    AttemptStatus, Event, EventType, FailureReason, ListFilter, RegisterRequest, RelayError,
    SubscriptionStatus,
};

fn event() -> Event {
    Event::new(EventType::TicketCreated, json!({"ticket": 42}), "helpdesk")
}

#[tokio::test]
async fn test_delete_prevents_any_network_call() {
    let transport = RecordingTransport::ok();
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::TicketCreated]);

    relay.emit(event()).unwrap();
    relay.emit(event()).unwrap();
    assert_eq!(relay.queued(), 2);

    let deleted = relay.delete(ACTOR, webhook_id).unwrap();
    assert_eq!(deleted.status, SubscriptionStatus::Deleted);
    assert_eq!(relay.queued(), 0);

    let pool = relay.start_workers();
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.shutdown().await;

    assert_eq!(transport.call_count(), 0);
    let history = relay.history(webhook_id).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|a| a.status == AttemptStatus::FailedPermanent
        && a.reason == Some(FailureReason::SubscriptionInactive)));

    // new events no longer match the tombstone
    assert!(relay.emit(event()).unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_cancels_pending_retry() {
    let transport = RecordingTransport::always(Ok(hookwire::delivery::TransportResponse {
        status: 429,
        retry_after: Some("60".to_string()),
    }));
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::TicketCreated]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    wait_for_history(&relay, webhook_id, |h| h.len() == 2).await;

    relay.delete(ACTOR, webhook_id).unwrap();
    pool.shutdown().await;

    let history = relay.history(webhook_id).unwrap();
    assert_eq!(history[0].status, AttemptStatus::ScheduledRetry);
    assert_eq!(history[1].status, AttemptStatus::FailedPermanent);
    assert_eq!(history[1].reason, Some(FailureReason::SubscriptionInactive));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(relay.queued(), 0);
}

#[tokio::test]
async fn test_disabled_subscription_is_skipped_at_claim_time() {
    let transport = RecordingTransport::ok();
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::TicketCreated]);

    relay.emit(event()).unwrap();
    relay.disable(ACTOR, webhook_id).unwrap();

    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, |h| {
        h.iter().all(|a| a.status.is_terminal())
    })
    .await;
    pool.shutdown().await;

    assert_eq!(history[0].status, AttemptStatus::FailedPermanent);
    assert_eq!(history[0].reason, Some(FailureReason::SubscriptionInactive));
    assert_eq!(transport.call_count(), 0);

    // re-enabled subscriptions receive new events
    relay.enable(ACTOR, webhook_id).unwrap();
    assert_eq!(relay.emit(event()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_deleted_subscriptions_cannot_be_revived_or_tested() {
    let relay = relay_with(RecordingTransport::ok());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::TicketCreated]);

    relay.delete(ACTOR, webhook_id).unwrap();
    // deleting again is a no-op
    assert_eq!(
        relay.delete(ACTOR, webhook_id).unwrap().status,
        SubscriptionStatus::Deleted
    );

    assert!(matches!(
        relay.enable(ACTOR, webhook_id),
        Err(RelayError::Validation(_))
    ));
    assert!(matches!(
        relay.test(ACTOR, webhook_id).await,
        Err(RelayError::Validation(_))
    ));
    assert!(matches!(
        relay.history(uuid::Uuid::new_v4()),
        Err(RelayError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_registry_mutations_are_audited_without_secrets() {
    let relay = relay_with(RecordingTransport::ok());
    let registration = relay
        .register(
            "alice",
            RegisterRequest {
                url: "https://ex.com/hook".to_string(),
                event_filter: vec![EventType::EmailSent],
                secret: None,
            },
        )
        .unwrap();
    let id = registration.subscription.id;
    assert!(registration.secret.starts_with("whsec_"));

    relay.disable("bob", id).unwrap();
    relay.disable("bob", id).unwrap();
    relay.enable("bob", id).unwrap();
    relay.delete("carol", id).unwrap();

    let entries = relay.audit_entries();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        actions,
        vec![
            "webhook_registered",
            "webhook_disabled",
            "webhook_enabled",
            "webhook_deleted"
        ]
    );
    assert_eq!(entries[0].actor, "alice");
    assert_eq!(entries[3].actor, "carol");

    let serialized = serde_json::to_string(&entries).unwrap();
    assert!(!serialized.contains(&registration.secret));
    assert_eq!(relay.verify_audit_chain().unwrap(), 4);
}

#[tokio::test]
async fn test_list_filters_by_status_and_type() {
    let relay = relay_with(RecordingTransport::ok());
    let a = register(&relay, "https://a.example/hook", vec![EventType::EmailSent]);
    let b = register(
        &relay,
        "https://b.example/hook",
        vec![EventType::EmailSent, EventType::TicketCreated],
    );
    register(&relay, "https://c.example/hook", vec![EventType::TicketCreated]);
    relay.disable(ACTOR, b).unwrap();

    let email = relay.list(&ListFilter {
        status: None,
        event_type: Some(EventType::EmailSent),
    });
    assert_eq!(email.len(), 2);
    assert!(email.iter().any(|s| s.id == a));
    assert!(email.iter().any(|s| s.id == b));

    let active_email = relay.list(&ListFilter {
        status: Some(SubscriptionStatus::Active),
        event_type: Some(EventType::EmailSent),
    });
    assert_eq!(active_email.len(), 1);
    assert_eq!(active_email[0].id, a);

    assert_eq!(relay.list(&ListFilter::default()).len(), 3);
}

#[tokio::test]
async fn test_invalid_registrations_are_rejected() {
    let relay = relay_with(RecordingTransport::ok());
    for request in [
        RegisterRequest {
            url: "http://ex.com/hook".to_string(),
            event_filter: vec![EventType::EmailSent],
            secret: None,
        },
        RegisterRequest {
            url: "https://ex.com/hook".to_string(),
            event_filter: vec![],
            secret: None,
        },
        RegisterRequest {
            url: "https://ex.com/hook".to_string(),
            event_filter: vec![EventType::EmailSent],
            secret: Some("short".to_string()),
        },
    ] {
        assert!(matches!(
            relay.register(ACTOR, request),
            Err(RelayError::Validation(_))
        ));
    }
    assert!(relay.audit_entries().is_empty());
}

#[tokio::test]
async fn test_purge_requires_matching_approval() {
    let relay = relay_with(RecordingTransport::ok());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::EmailSent]);

    let stale = relay.propose_purge(ACTOR, webhook_id).unwrap();
    // the subscription changes after the proposal, so the plan no longer matches
    relay.disable(ACTOR, webhook_id).unwrap();
    assert!(matches!(
        relay.execute_purge(ACTOR, stale.token, webhook_id),
        Err(RelayError::Approval(_))
    ));
    assert_eq!(relay.get(webhook_id).unwrap().status, SubscriptionStatus::Disabled);

    let token = relay.propose_purge(ACTOR, webhook_id).unwrap();
    let purged = relay.execute_purge(ACTOR, token.token, webhook_id).unwrap();
    assert_eq!(purged.status, SubscriptionStatus::Deleted);

    assert!(matches!(
        relay.execute_purge(ACTOR, token.token, webhook_id),
        Err(RelayError::Approval(_))
    ));

    let actions: Vec<String> = relay.audit_entries().into_iter().map(|e| e.action).collect();
    assert!(actions.contains(&"approval_proposed".to_string()));
    assert!(actions.contains(&"approval_consumed".to_string()));
    assert_eq!(actions.last().map(String::as_str), Some("webhook_deleted"));
    assert!(relay.verify_audit_chain().is_ok());
}
