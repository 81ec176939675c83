//! Backend-agnostic store handle.
//!
//! The hub holds a [`Store`] and never knows which backend is behind it.
//! Dispatch is a plain enum match rather than a boxed trait object.

use parlor_types::{Identity, ReadingSession, SessionId, SettlementEntry, UserId};

use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::model::{SessionFilter, SettleResult, SettlementCommand, Transition, TransitionResult};
use crate::pg::PgStore;

/// Identity, balance and session persistence.
#[derive(Debug, Clone)]
pub enum Store {
    /// In-process store.
    Memory(MemoryStore),
    /// `PostgreSQL` store.
    Postgres(PgStore),
}

impl Store {
    /// A fresh, empty in-memory store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Short backend name for logs.
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Release backend resources on shutdown.
    pub async fn close(&self) {
        if let Self::Postgres(store) = self {
            store.close().await;
        }
    }

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn get_identity(&self, id: UserId) -> Result<Option<Identity>, DbError> {
        match self {
            Self::Memory(store) => Ok(store.get_identity(id).await),
            Self::Postgres(store) => store.get_identity(id).await,
        }
    }

    /// Insert a user record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Duplicate`] if the id is taken.
    pub async fn insert_identity(&self, identity: Identity) -> Result<(), DbError> {
        match self {
            Self::Memory(store) => store.insert_identity(identity).await,
            Self::Postgres(store) => store.insert_identity(&identity).await,
        }
    }

    /// Set a user's presence flag.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user.
    pub async fn set_online(&self, id: UserId, online: bool) -> Result<(), DbError> {
        match self {
            Self::Memory(store) => store.set_online(id, online).await,
            Self::Postgres(store) => store.set_online(id, online).await,
        }
    }

    /// Add `amount` to a user's balance and return the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user.
    pub async fn credit_balance(&self, id: UserId, amount: i64) -> Result<i64, DbError> {
        match self {
            Self::Memory(store) => store.credit_balance(id, amount).await,
            Self::Postgres(store) => store.credit_balance(id, amount).await,
        }
    }

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_session(&self, session: ReadingSession) -> Result<(), DbError> {
        match self {
            Self::Memory(store) => store.insert_session(session).await,
            Self::Postgres(store) => store.insert_session(&session).await,
        }
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn get_session(&self, id: SessionId) -> Result<Option<ReadingSession>, DbError> {
        match self {
            Self::Memory(store) => Ok(store.get_session(id).await),
            Self::Postgres(store) => store.get_session(id).await,
        }
    }

    /// List sessions matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ReadingSession>, DbError> {
        match self {
            Self::Memory(store) => Ok(store.list_sessions(filter).await),
            Self::Postgres(store) => store.list_sessions(filter).await,
        }
    }

    /// Compare-and-set a session's status.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn transition(
        &self,
        id: SessionId,
        transition: &Transition,
    ) -> Result<TransitionResult, DbError> {
        match self {
            Self::Memory(store) => Ok(store.transition(id, transition).await),
            Self::Postgres(store) => store.transition(id, transition).await,
        }
    }

    /// Claim an `in_progress` session for settlement. While the claim is
    /// held, every [`transition`](Self::transition) and every other claim
    /// on the session reports a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn claim_settlement(&self, id: SessionId) -> Result<TransitionResult, DbError> {
        match self {
            Self::Memory(store) => Ok(store.claim_settlement(id).await),
            Self::Postgres(store) => store.claim_settlement(id).await,
        }
    }

    /// Release a claim taken by [`claim_settlement`](Self::claim_settlement).
    /// A completed settlement releases its own claim.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn release_settlement(&self, id: SessionId) -> Result<(), DbError> {
        match self {
            Self::Memory(store) => {
                store.release_settlement(id).await;
                Ok(())
            }
            Self::Postgres(store) => store.release_settlement(id).await,
        }
    }

    /// Apply a settlement atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a conservation anomaly or backend failure.
    pub async fn settle(&self, command: &SettlementCommand) -> Result<SettleResult, DbError> {
        match self {
            Self::Memory(store) => store.settle(command).await,
            Self::Postgres(store) => store.settle(command).await,
        }
    }

    /// Ledger legs recorded for a session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a backend failure.
    pub async fn ledger_for_session(
        &self,
        id: SessionId,
    ) -> Result<Vec<SettlementEntry>, DbError> {
        match self {
            Self::Memory(store) => Ok(store.ledger_for_session(id).await),
            Self::Postgres(store) => store.ledger_for_session(id).await,
        }
    }
}

impl From<MemoryStore> for Store {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}

impl From<PgStore> for Store {
    fn from(store: PgStore) -> Self {
        Self::Postgres(store)
    }
}
