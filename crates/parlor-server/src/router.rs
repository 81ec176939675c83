//! Axum router construction.
//!
//! Assembles the REST routes and the signaling socket into a single
//! [`Router`] with CORS and request tracing.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete router.
///
/// - `GET /health` -- liveness and connection count
/// - `GET /ws` -- signaling socket
/// - `POST /api/sessions` -- book a reading
/// - `GET /api/sessions` -- list visible sessions
/// - `GET /api/sessions/{id}` -- single session
/// - `POST /api/sessions/{id}/payment` -- confirm the payment link
/// - `POST /api/sessions/{id}/payment-failed` -- report a failed payment
/// - `POST /api/sessions/{id}/start` -- go live
/// - `POST /api/sessions/{id}/end` -- end and settle
/// - `POST /api/sessions/{id}/cancel` -- call off
/// - `GET /api/providers/online` -- providers with a live connection
/// - `POST /api/users/{id}/top-up` -- credit a balance (admin)
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // WebSocket
        .route("/ws", get(ws::ws_signaling))
        // Sessions
        .route(
            "/api/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/payment", post(handlers::confirm_payment))
        .route(
            "/api/sessions/{id}/payment-failed",
            post(handlers::fail_payment),
        )
        .route("/api/sessions/{id}/start", post(handlers::start_session))
        .route("/api/sessions/{id}/end", post(handlers::end_session))
        .route("/api/sessions/{id}/cancel", post(handlers::cancel_session))
        // Users
        .route("/api/providers/online", get(handlers::online_providers))
        .route("/api/users/{id}/top-up", post(handlers::top_up))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
