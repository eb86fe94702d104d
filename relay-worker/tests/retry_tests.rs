//! Retry policy, exhaustion and manual retry.

mod common;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use common::*;
use hookwire::delivery::TransportResponse;
use hookwire::{
    AttemptKind, AttemptStatus, DeliveryError, Event, EventType, FailureReason, RelayError,
};

fn event() -> Event {
    Event::new(EventType::WorkflowCompleted, json!({}), "workflow-engine").with_id("E1")
}

fn finished(history: &[hookwire::DeliveryAttempt]) -> bool {
    history.iter().any(|a| a.status.is_terminal())
}

#[tokio::test]
async fn test_three_failures_exhaust_the_chain() {
    let transport = RecordingTransport::always(Err(DeliveryError::ConnectionRefused));
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, finished).await;
    pool.shutdown().await;

    let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let statuses: Vec<AttemptStatus> = history.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            AttemptStatus::ScheduledRetry,
            AttemptStatus::ScheduledRetry,
            AttemptStatus::Exhausted
        ]
    );
    assert!(history.iter().all(|a| a.chain_id == history[0].chain_id));
    assert!(history
        .iter()
        .all(|a| a.reason == Some(FailureReason::ConnectionRefused)));
    // no fourth attempt
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.call_count(), 3);

    let exhausted: Vec<_> = relay
        .audit_entries()
        .into_iter()
        .filter(|e| e.action == "delivery_exhausted")
        .collect();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].actor, "delivery-worker");
    assert!(relay.verify_audit_chain().is_ok());
}

#[tokio::test]
async fn test_backoff_delays_grow() {
    let transport = RecordingTransport::always(Err(DeliveryError::Timeout));
    let relay = relay_with(transport);
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, finished).await;
    pool.shutdown().await;

    // base 10ms, no jitter: retry n is due base * 2^(n-1) after try n was decided
    let first = history[0].next_retry_at.unwrap() - history[0].sent_at.unwrap();
    let second = history[1].next_retry_at.unwrap() - history[1].sent_at.unwrap();
    assert!(first >= chrono::Duration::milliseconds(10));
    assert!(second >= chrono::Duration::milliseconds(20));
    assert_eq!(history[1].not_before, history[0].next_retry_at.unwrap());
    assert_eq!(history[2].not_before, history[1].next_retry_at.unwrap());
}

#[tokio::test]
async fn test_retry_after_overrides_backoff() {
    let transport = RecordingTransport::always(Ok(TransportResponse {
        status: 429,
        retry_after: Some("5".to_string()),
    }));
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, |h| h.len() >= 2).await;
    pool.shutdown().await;

    let first = &history[0];
    assert_eq!(first.response_code, Some(429));
    assert_eq!(first.reason, Some(FailureReason::RateLimited));
    let next = first.next_retry_at.unwrap();
    assert!(next >= first.sent_at.unwrap() + chrono::Duration::seconds(5));

    let second = &history[1];
    assert_eq!(second.attempt_number, 2);
    assert_eq!(second.status, AttemptStatus::Pending);
    assert_eq!(second.not_before, next);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let transport = RecordingTransport::status(410);
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, finished).await;
    pool.shutdown().await;

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AttemptStatus::FailedPermanent);
    assert_eq!(history[0].response_code, Some(410));
    assert_eq!(transport.call_count(), 1);
    assert!(relay
        .audit_entries()
        .iter()
        .all(|e| e.action != "delivery_exhausted"));
}

#[tokio::test]
async fn test_recovers_after_transient_server_errors() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(2);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let relay = hookwire::Relay::builder(test_config()).build().unwrap();
    let webhook_id = register(&relay, &server.uri(), vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, finished).await;
    pool.shutdown().await;

    assert_eq!(history.len(), 3);
    assert_eq!(history[0].response_code, Some(500));
    assert_eq!(history[2].status, AttemptStatus::Success);
    assert_eq!(responder.attempt_count(), 3);
}

#[tokio::test]
async fn test_manual_retry_starts_a_fresh_chain() {
    let transport = RecordingTransport::scripted(
        vec![
            Err(DeliveryError::Timeout),
            Err(DeliveryError::Timeout),
            Err(DeliveryError::Timeout),
        ],
        Ok(TransportResponse {
            status: 200,
            retry_after: None,
        }),
    );
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    relay.emit(event()).unwrap();
    let pool = relay.start_workers();
    let history = wait_for_history(&relay, webhook_id, finished).await;
    let exhausted = history.last().unwrap().clone();
    assert_eq!(exhausted.status, AttemptStatus::Exhausted);

    // only final failures can be retried
    assert!(matches!(
        relay.retry(ACTOR, history[0].id),
        Err(RelayError::Validation(_))
    ));

    let fresh = relay.retry(ACTOR, exhausted.id).unwrap();
    assert_eq!(fresh.attempt_number, 1);
    assert_eq!(fresh.kind, AttemptKind::ManualRetry);
    assert_ne!(fresh.chain_id, exhausted.chain_id);
    assert_eq!(fresh.event_id, "E1");

    let delivered = wait_for(Duration::from_secs(10), || {
        relay
            .delivery(fresh.id)
            .ok()
            .filter(|a| a.status == AttemptStatus::Success)
    })
    .await;
    pool.shutdown().await;

    assert!(delivered.is_some());
    assert_eq!(transport.call_count(), 4);
    assert!(relay
        .audit_entries()
        .iter()
        .any(|e| e.action == "delivery_manual_retry" && e.actor == ACTOR));
    assert!(relay.verify_audit_chain().is_ok());
}

#[tokio::test]
async fn test_test_delivery_is_never_retried() {
    let transport = RecordingTransport::always(Err(DeliveryError::Timeout));
    let relay = relay_with(transport.clone());
    let webhook_id = register(&relay, "https://ex.com/hook", vec![EventType::WorkflowCompleted]);

    let test = relay.test(ACTOR, webhook_id).await.unwrap();
    assert_eq!(test.kind, AttemptKind::Test);
    assert_eq!(test.status, AttemptStatus::FailedPermanent);

    assert!(matches!(
        relay.retry(ACTOR, test.id),
        Err(RelayError::Validation(_))
    ));

    let pool = relay.start_workers();
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.shutdown().await;

    assert_eq!(transport.call_count(), 1);
    assert_eq!(relay.queued(), 0);
    assert_eq!(relay.history(webhook_id).unwrap().len(), 1);
    assert!(!relay
        .audit_entries()
        .iter()
        .any(|e| e.action == "delivery_manual_retry"));
}
