//! Error types for the data layer.
//!
//! Domain outcomes such as a status conflict or insufficient funds are not
//! errors here; they are variants of [`TransitionResult`](crate::TransitionResult)
//! and [`SettleResult`](crate::SettleResult). [`DbError`] is reserved for
//! infrastructure failures and corrupted rows.

use parlor_ledger::LedgerError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be mapped back to a domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// A row the operation depends on does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of row.
        entity: &'static str,
        /// Its id.
        id: uuid::Uuid,
    },

    /// A row with the same id already exists.
    #[error("{entity} already exists: {id}")]
    Duplicate {
        /// Kind of row.
        entity: &'static str,
        /// Its id.
        id: uuid::Uuid,
    },

    /// Ledger legs failed validation or the conservation check.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A settlement's legs disagree with its amounts; nothing was written.
    #[error("ledger anomaly: {0}")]
    Anomaly(String),

    /// A balance update would overflow.
    #[error("balance overflow for user {0}")]
    BalanceOverflow(uuid::Uuid),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
