//! Outbound HTTP transport.
//!
//! The worker only needs "POST these bytes with these headers and tell me the
//! status". The trait keeps the HTTP client swappable so tests can script
//! responses without a network.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{DeliveryError, RelayError, RelayResult};

/// One signed POST to a subscriber.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Subscriber's answer. Any status code is a response; only network level
/// failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if present.
    pub retry_after: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError>;
}

/// reqwest-backed transport. Redirects are not followed.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> RelayResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("hookwire/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| RelayError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header(CONTENT_TYPE, "application/json");

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        match builder.body(request.body).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                debug!(url = %request.url, status_code = status, "webhook_response_received");
                Ok(TransportResponse {
                    status,
                    retry_after,
                })
            }
            Err(e) => {
                let err = classify(&e);
                warn!(url = %request.url, error = %e, kind = %err, "webhook_send_failed");
                Err(err)
            }
        }
    }
}

fn classify(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        return DeliveryError::Timeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return DeliveryError::ConnectionRefused,
                io::ErrorKind::TimedOut => return DeliveryError::Timeout,
                _ => {}
            }
        }
        source = cause.source();
    }

    DeliveryError::Connection(err.to_string())
}
