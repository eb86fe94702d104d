//! Admin HTTP API.
//!
//! JSON over HTTP for the relay operations. Mutating calls are attributed to
//! the `X-Actor` header in the audit log.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    ApiError, AppState, EmitRequest, EmitResponse, ErrorResponse, HealthResponse, VerifyResponse,
    ACTOR_HEADER, DEFAULT_ACTOR,
};

/// Build the admin router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/events", post(handlers::emit_event))
        .route(
            "/webhooks",
            post(handlers::register_webhook).get(handlers::list_webhooks),
        )
        .route(
            "/webhooks/:id",
            get(handlers::get_webhook).delete(handlers::delete_webhook),
        )
        .route("/webhooks/:id/enable", post(handlers::enable_webhook))
        .route("/webhooks/:id/disable", post(handlers::disable_webhook))
        .route("/webhooks/:id/test", post(handlers::test_webhook))
        .route("/webhooks/:id/deliveries", get(handlers::webhook_deliveries))
        .route("/webhooks/:id/purge", post(handlers::propose_purge))
        .route("/webhooks/:id/purge/:token", post(handlers::execute_purge))
        .route("/deliveries/:id", get(handlers::get_delivery))
        .route("/deliveries/:id/retry", post(handlers::retry_delivery))
        .route("/audit/verify", get(handlers::verify_audit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
