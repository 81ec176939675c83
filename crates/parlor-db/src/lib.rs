//! Data layer for Parlor: identities, balances, reading sessions and the
//! settlement ledger.
//!
//! Two backends sit behind the [`Store`] enum:
//!
//! ```text
//! Hub
//!  |
//!  +-- Store::Memory   --> MemoryStore (one mutex, dev and tests)
//!  |
//!  +-- Store::Postgres --> PgStore (PostgresPool, one transaction per settlement)
//!        |-- users             (identity + balance, CHECK balance >= 0)
//!        |-- reading_sessions  (status CAS, frozen cost fields)
//!        +-- settlement_ledger (append-only legs)
//! ```
//!
//! # Modules
//!
//! - [`model`] -- transition and settlement commands and their outcomes
//! - [`memory`] -- in-process backend
//! - [`pg`] -- `PostgreSQL` backend
//! - [`postgres`] -- connection pool and configuration
//! - [`store`] -- the dispatching [`Store`] handle
//! - [`error`] -- shared error type

pub mod error;
pub mod memory;
pub mod model;
pub mod pg;
pub mod postgres;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use memory::MemoryStore;
pub use model::{
    SessionFilter, SettleResult, SettledSession, SettlementCommand, Transition, TransitionResult,
};
pub use pg::PgStore;
pub use postgres::{PostgresConfig, PostgresPool};
pub use store::Store;
