//! HTTP and `WebSocket` surface of the Parlor reading-session hub.
//!
//! - **`WebSocket` endpoint** (`/ws`) carrying the signaling protocol:
//!   presence, authentication, subscriptions and peer-to-peer call setup
//! - **REST endpoints** (`/api/...`) for the session lifecycle, online
//!   providers and balance top-ups
//! - **`GET /health`** for liveness
//!
//! The callers' identity on REST routes comes from the `x-user-id` header;
//! on the socket it comes from the `authenticate` frame.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use state::AppState;
