//! Shared application state for the HTTP and `WebSocket` handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parlor_hub::Hub;

/// State injected into every handler via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The reading-session hub.
    pub hub: Arc<Hub>,
    /// When the server process started, reported by `/health`.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap a hub.
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            started_at: Utc::now(),
        }
    }
}
