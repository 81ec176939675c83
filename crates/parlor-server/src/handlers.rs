//! REST endpoint handlers.
//!
//! Every `/api` handler resolves the caller from the `x-user-id` header
//! through the store, then delegates to the hub. Authorization happens in
//! the hub, so handlers only translate between HTTP and hub calls.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `POST` | `/api/sessions` | Book a reading |
//! | `GET` | `/api/sessions` | List sessions (`clientId`, `providerId`, `status`) |
//! | `GET` | `/api/sessions/{id}` | Single session |
//! | `POST` | `/api/sessions/{id}/payment` | `{paymentRef}` confirms the payment link |
//! | `POST` | `/api/sessions/{id}/payment-failed` | The payment link failed |
//! | `POST` | `/api/sessions/{id}/start` | Go live |
//! | `POST` | `/api/sessions/{id}/end` | `{durationSeconds}` ends and settles |
//! | `POST` | `/api/sessions/{id}/cancel` | `{reason?}` calls off |
//! | `GET` | `/api/providers/online` | Online providers |
//! | `POST` | `/api/users/{id}/top-up` | `{amount}` credits a balance (admin) |

use std::str::FromStr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use parlor_hub::{CreateSession, HubError, ListSessions, Settlement};
use parlor_types::{Identity, SessionId, UserId};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the caller's user id.
pub const CALLER_HEADER: &str = "x-user-id";

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/sessions/{id}/payment`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentBody {
    /// External payment intent reference.
    pub payment_ref: String,
}

/// Body of `POST /api/sessions/{id}/end`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndBody {
    /// Billed duration of the reading.
    pub duration_seconds: u32,
}

/// Body of `POST /api/sessions/{id}/cancel`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    /// Free-text reason stored on the session.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `POST /api/users/{id}/top-up`.
#[derive(Debug, Deserialize)]
pub struct TopUpBody {
    /// Amount to credit, in minor units.
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe with a few counters.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();
    Json(json!({
        "status": "ok",
        "store": state.hub.store().backend(),
        "connections": state.hub.registry().len().await,
        "uptimeSeconds": uptime,
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Book a reading for the caller.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateSession>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let session = state.hub.sessions().create(&caller, &request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// List sessions visible to the caller.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListSessions>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let sessions = state.hub.sessions().list(&caller, query).await?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// Fetch one session.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    Ok(Json(state.hub.sessions().get(&caller, id).await?))
}

/// Record the completed payment link.
pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PaymentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    let session = state
        .hub
        .sessions()
        .confirm_payment(&caller, id, &body.payment_ref)
        .await?;
    Ok(Json(session))
}

/// Record a failed payment link.
pub async fn fail_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    Ok(Json(state.hub.sessions().fail_payment(&caller, id).await?))
}

/// Start a reading.
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    Ok(Json(state.hub.sessions().start(&caller, id).await?))
}

/// End a reading and settle it. Returns the frozen cost and split.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<EndBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    let settlement = state
        .hub
        .sessions()
        .end(&caller, id, body.duration_seconds)
        .await?;
    Ok(Json(settlement_body(&settlement)))
}

/// Cancel a reading. The body is optional.
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let id: SessionId = parse_id(&id)?;
    let Json(body) = body.unwrap_or_default();
    let session = state.hub.sessions().cancel(&caller, id, body.reason).await?;
    Ok(Json(session))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Providers with a live connection.
pub async fn online_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    caller(&state, &headers).await?;
    let providers = state.hub.online_providers().await?;
    Ok(Json(json!({
        "count": providers.len(),
        "providers": providers,
    })))
}

/// Credit a user's balance. Admin only.
pub async fn top_up(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TopUpBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller(&state, &headers).await?;
    let user_id: UserId = parse_id(&id)?;
    let balance = state.hub.top_up(&caller, user_id, body.amount).await?;
    Ok(Json(json!({
        "userId": user_id,
        "accountBalance": balance,
    })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the `x-user-id` header to a known identity.
async fn caller(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let raw = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(HubError::Unauthenticated)?;
    let user_id = raw
        .parse::<UserId>()
        .map_err(|_parse| HubError::Unauthenticated)?;
    Ok(state.hub.caller(user_id).await?)
}

/// Parse an id from a path segment.
fn parse_id<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr<Err = uuid::Error>,
{
    raw.parse::<T>()
        .map_err(|e| ApiError::InvalidId(format!("{raw}: {e}")))
}

fn settlement_body(settlement: &Settlement) -> serde_json::Value {
    json!({
        "session": settlement.session,
        "totalCost": settlement.amounts.total,
        "providerShare": settlement.amounts.provider,
        "platformShare": settlement.amounts.platform,
        "path": settlement.path.kind(),
        "newClientBalance": settlement.path.new_client_balance(),
        "newProviderBalance": settlement.new_provider_balance,
    })
}
