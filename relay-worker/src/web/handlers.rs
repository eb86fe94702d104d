//! Admin API handlers.
//!
//! Thin wrappers over [`Relay`]: parse the request, call one operation, map
//! the result to JSON. The acting principal comes from the `X-Actor` header.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalToken;
use crate::error::RelayError;
use crate::event::{Event, EventType};
use crate::ledger::DeliveryAttempt;
use crate::registry::{ListFilter, RegisterRequest, SubscriptionView};
use crate::relay::{Registration, Relay};
use crate::storage::off_runtime;

/// Header naming the principal behind a mutating call.
pub const ACTOR_HEADER: &str = "X-Actor";

/// Actor recorded when the header is missing.
pub const DEFAULT_ACTOR: &str = "admin-api";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

// =============================================================================
// Errors
// =============================================================================

/// Error body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
}

/// `RelayError` rendered as an HTTP response.
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::ChainIntegrity { .. }
            | RelayError::Conflict { .. }
            | RelayError::Approval(_)
            | RelayError::ExhaustedRetries { .. } => StatusCode::CONFLICT,
            RelayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self.0, "admin_request_failed");
        } else {
            warn!(status_code = status.as_u16(), error = %self.0, "admin_request_rejected");
        }

        (
            status,
            Json(ErrorResponse {
                status: "error",
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a relay call that writes to the stores off the async runtime.
async fn on_relay<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    F: FnOnce(&Relay) -> Result<T, RelayError> + Send + 'static,
    T: Send + 'static,
{
    let relay = Arc::clone(&state.relay);
    Ok(off_runtime(move || call(&relay)).await?)
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queued: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queued: state.relay.queued(),
    })
}

// =============================================================================
// Events
// =============================================================================

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    /// Generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Serialize)]
pub struct EmitResponse {
    pub status: &'static str,
    pub event_id: String,
    pub attempts: Vec<Uuid>,
}

pub async fn emit_event(
    State(state): State<AppState>,
    Json(body): Json<EmitRequest>,
) -> ApiResult<(StatusCode, Json<EmitResponse>)> {
    let source = body.source.unwrap_or_else(|| "admin-api".to_string());
    let mut event = Event::new(body.event_type, body.payload, source);
    if let Some(id) = body.id {
        event = event.with_id(id);
    }
    let event_id = event.id.clone();

    let attempts = on_relay(&state, move |relay| relay.emit(event)).await?;
    info!(event_id = %event_id, attempts = attempts.len(), "admin_event_emitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EmitResponse {
            status: "accepted",
            event_id,
            attempts: attempts.iter().map(|a| a.id).collect(),
        }),
    ))
}

// =============================================================================
// Webhooks
// =============================================================================

pub async fn register_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    let actor = actor(&headers);
    let registration = on_relay(&state, move |relay| relay.register(&actor, body)).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Json<Vec<SubscriptionView>> {
    Json(state.relay.list(&filter))
}

pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    Ok(Json(state.relay.get(id)?))
}

pub async fn enable_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let actor = actor(&headers);
    Ok(Json(on_relay(&state, move |relay| relay.enable(&actor, id)).await?))
}

pub async fn disable_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let actor = actor(&headers);
    Ok(Json(on_relay(&state, move |relay| relay.disable(&actor, id)).await?))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let actor = actor(&headers);
    Ok(Json(on_relay(&state, move |relay| relay.delete(&actor, id)).await?))
}

pub async fn test_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeliveryAttempt>> {
    Ok(Json(state.relay.test(&actor(&headers), id).await?))
}

pub async fn webhook_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    Ok(Json(state.relay.history(id)?))
}

// =============================================================================
// Deliveries
// =============================================================================

pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeliveryAttempt>> {
    Ok(Json(state.relay.delivery(id)?))
}

pub async fn retry_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<DeliveryAttempt>)> {
    let actor = actor(&headers);
    let attempt = on_relay(&state, move |relay| relay.retry(&actor, id)).await?;
    Ok((StatusCode::ACCEPTED, Json(attempt)))
}

// =============================================================================
// Approved purge
// =============================================================================

pub async fn propose_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApprovalToken>> {
    let actor = actor(&headers);
    Ok(Json(
        on_relay(&state, move |relay| relay.propose_purge(&actor, id)).await?,
    ))
}

pub async fn execute_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, token)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<SubscriptionView>> {
    let actor = actor(&headers);
    Ok(Json(
        on_relay(&state, move |relay| relay.execute_purge(&actor, token, id)).await?,
    ))
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Serialize)]
pub struct VerifyResponse {
    pub status: &'static str,
    pub entries: usize,
}

pub async fn verify_audit(State(state): State<AppState>) -> ApiResult<Json<VerifyResponse>> {
    let entries = on_relay(&state, |relay| relay.verify_audit_chain()).await?;
    Ok(Json(VerifyResponse {
        status: "ok",
        entries,
    }))
}
