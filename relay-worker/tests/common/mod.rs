//! Common test utilities for hookwire integration tests.
//!
//! Provides wiremock responders, a recording fake transport and helpers to
//! build a relay with fast retry timings.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

use hookwire::delivery::{OutboundRequest, Transport, TransportResponse};
use hookwire::{Config, DeliveryAttempt, DeliveryError, EventType, RegisterRequest, Relay};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const SECRET: &str = "whsec_test_secret_key_12345";

pub const ACTOR: &str = "integration-test";

/// Config with millisecond backoff and no jitter.
pub fn test_config() -> Config {
    Config {
        worker_concurrency: 2,
        request_timeout_ms: 2_000,
        retry_base_delay_ms: 10,
        retry_jitter_ms: 0,
        max_attempts: 3,
        lease_ttl_ms: 5_000,
        reaper_interval_ms: 50,
        ..Config::default()
    }
}

pub fn relay_with(transport: Arc<dyn Transport>) -> Relay {
    Relay::builder(test_config())
        .with_transport(transport)
        .build()
        .expect("relay should build")
}

pub fn register(relay: &Relay, url: &str, filter: Vec<EventType>) -> Uuid {
    relay
        .register(
            ACTOR,
            RegisterRequest {
                url: url.to_string(),
                event_filter: filter,
                secret: Some(SECRET.to_string()),
            },
        )
        .expect("registration should succeed")
        .subscription
        .id
}

/// Poll `check` until it returns `Some` or `timeout` elapses.
pub async fn wait_for<T, F>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the subscription's history satisfies `done`.
pub async fn wait_for_history<F>(relay: &Relay, webhook_id: Uuid, done: F) -> Vec<DeliveryAttempt>
where
    F: Fn(&[DeliveryAttempt]) -> bool,
{
    wait_for(Duration::from_secs(10), || {
        let history = relay.history(webhook_id).ok()?;
        done(&history).then_some(history)
    })
    .await
    .unwrap_or_else(|| {
        panic!(
            "history never settled: {:?}",
            relay.history(webhook_id).unwrap_or_default()
        )
    })
}

pub async fn settle<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("operation timed out")
}

// ---------------------------------------------------------------------------
// RecordingTransport - scripted fake, never touches the network
// ---------------------------------------------------------------------------

type SendResult = Result<TransportResponse, DeliveryError>;

/// Fake transport that records every request and answers from a script.
pub struct RecordingTransport {
    requests: Mutex<Vec<OutboundRequest>>,
    script: Mutex<VecDeque<SendResult>>,
    fallback: SendResult,
}

impl RecordingTransport {
    /// Answer every request with 200.
    pub fn ok() -> Arc<Self> {
        Self::always(Ok(TransportResponse {
            status: 200,
            retry_after: None,
        }))
    }

    pub fn status(code: u16) -> Arc<Self> {
        Self::always(Ok(TransportResponse {
            status: code,
            retry_after: None,
        }))
    }

    pub fn always(result: SendResult) -> Arc<Self> {
        Self::scripted(Vec::new(), result)
    }

    /// Answer from `script` in order, then with `fallback`.
    pub fn scripted(script: Vec<SendResult>, fallback: SendResult) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            fallback,
        })
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: OutboundRequest) -> SendResult {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn header<'a>(request: &'a OutboundRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Fail `n` times with 500, then return 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}
