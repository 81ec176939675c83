//! Real-time reading-session hub.
//!
//! Connections register with the [`Registry`], authenticate, and exchange
//! signaling frames routed by the [`SignalingRouter`]. Sessions move through
//! the [`SessionMachine`]; ending one runs the [`SettlementEngine`], which
//! debits the client's balance or captures a pre-authorized payment through
//! the [`PaymentGateway`]. Provider presence is derived from connection
//! churn by the [`PresencePublisher`].
//!
//! ```text
//! socket ──> Hub::receive ──> SignalingRouter ──┬─> Registry (unicast / channel / broadcast)
//!                                               └─> PresencePublisher
//! HTTP   ──> SessionMachine ──> Store (CAS transitions)
//!                 └─ end ──> SettlementEngine ──> PaymentGateway + Store::settle
//! ```
//!
//! # Modules
//!
//! - [`config`] -- `parlor-config.yaml` structures and loader
//! - [`registry`] -- live connections, identities and channels
//! - [`router`] -- inbound frame dispatch
//! - [`presence`] -- provider online/offline publication
//! - [`authz`] -- per-action authorization predicate
//! - [`sessions`] -- session lifecycle
//! - [`settlement`] -- cost computation and atomic application
//! - [`gateway`] -- external payment gateway client
//! - [`hub`] -- the [`Hub`] tying it together
//! - [`error`] -- error types

pub mod authz;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod router;
pub mod sessions;
pub mod settlement;

// Re-export primary types for convenience.
pub use authz::{Action, authorize};
pub use config::{ConfigError, ParlorConfig};
pub use error::{GatewayError, HubError};
pub use gateway::{HttpGateway, LocalGateway, PaymentGateway};
pub use hub::Hub;
pub use presence::{PresenceEvent, PresencePublisher};
pub use registry::Registry;
pub use router::SignalingRouter;
pub use sessions::{CreateSession, ListSessions, SessionMachine};
pub use settlement::{Settlement, SettlementEngine, SettlementPath};
