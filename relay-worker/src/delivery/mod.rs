//! Outbound delivery: transport, backoff policy and the worker pool.

pub mod backoff;
pub mod transport;
pub mod worker;

pub use backoff::{backoff_delay, exponential_delay, parse_retry_after};
pub use transport::{HttpTransport, OutboundRequest, Transport, TransportResponse};
pub use worker::{
    build_request, decide_outcome, decide_test_outcome, deliver_test, execute_attempt,
    exhaustion_digest, reap_expired, DeliveryContext, RetryPolicy, WorkerPool, WORKER_ACTOR,
};
