//! In-process store used in development and tests.
//!
//! All state sits behind one [`tokio::sync::Mutex`]. Every operation takes
//! the lock once and performs no `.await` while holding it, so each
//! operation (settlement included) is atomic with respect to every other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parlor_ledger::Payer;
use parlor_types::{Identity, ReadingSession, SessionId, SessionStatus, SettlementEntry, UserId};
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::model::{
    SessionFilter, SettleResult, SettledSession, SettlementCommand, Transition, TransitionResult,
};

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<UserId, Identity>,
    sessions: BTreeMap<SessionId, ReadingSession>,
    /// Sessions claimed by an in-flight settlement.
    settling: BTreeSet<SessionId>,
    ledger: Vec<SettlementEntry>,
}

/// Shared in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a user.
    pub async fn get_identity(&self, id: UserId) -> Option<Identity> {
        self.inner.lock().await.users.get(&id).cloned()
    }

    /// Insert a user record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Duplicate`] if the id is taken.
    pub async fn insert_identity(&self, identity: Identity) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        if inner.users.contains_key(&identity.id) {
            return Err(DbError::Duplicate {
                entity: "user",
                id: identity.id.into_inner(),
            });
        }
        inner.users.insert(identity.id, identity);
        Ok(())
    }

    /// Set a user's presence flag.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user.
    pub async fn set_online(&self, id: UserId, online: bool) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        let user = inner.users.get_mut(&id).ok_or(DbError::NotFound {
            entity: "user",
            id: id.into_inner(),
        })?;
        user.is_online = online;
        Ok(())
    }

    /// Add `amount` to a user's balance and return the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown user and
    /// [`DbError::BalanceOverflow`] if the sum overflows.
    pub async fn credit_balance(&self, id: UserId, amount: i64) -> Result<i64, DbError> {
        let mut inner = self.inner.lock().await;
        let user = inner.users.get_mut(&id).ok_or(DbError::NotFound {
            entity: "user",
            id: id.into_inner(),
        })?;
        let balance = user
            .account_balance
            .checked_add(amount)
            .filter(|b| *b >= 0)
            .ok_or(DbError::BalanceOverflow(id.into_inner()))?;
        user.account_balance = balance;
        Ok(balance)
    }

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Duplicate`] if the id is taken.
    pub async fn insert_session(&self, session: ReadingSession) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(DbError::Duplicate {
                entity: "session",
                id: session.id.into_inner(),
            });
        }
        inner.sessions.insert(session.id, session);
        Ok(())
    }

    /// Fetch a session.
    pub async fn get_session(&self, id: SessionId) -> Option<ReadingSession> {
        self.inner.lock().await.sessions.get(&id).cloned()
    }

    /// List sessions matching `filter`, newest first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<ReadingSession> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<ReadingSession> = inner
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Compare-and-set a session's status.
    pub async fn transition(&self, id: SessionId, transition: &Transition) -> TransitionResult {
        let mut inner = self.inner.lock().await;
        let claimed = inner.settling.contains(&id);
        let Some(session) = inner.sessions.get_mut(&id) else {
            return TransitionResult::NotFound;
        };
        if claimed || !transition.allowed_from.contains(&session.status) {
            return TransitionResult::Conflict(session.status);
        }
        transition.apply(session);
        TransitionResult::Applied(session.clone())
    }

    /// Claim an `in_progress` session for settlement. At most one claim
    /// is held per session.
    pub async fn claim_settlement(&self, id: SessionId) -> TransitionResult {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get(&id) else {
            return TransitionResult::NotFound;
        };
        if session.status != SessionStatus::InProgress {
            return TransitionResult::Conflict(session.status);
        }
        let session = session.clone();
        if !inner.settling.insert(id) {
            return TransitionResult::Conflict(session.status);
        }
        TransitionResult::Applied(session)
    }

    /// Drop a settlement claim so the session can be ended or cancelled again.
    pub async fn release_settlement(&self, id: SessionId) {
        self.inner.lock().await.settling.remove(&id);
    }

    /// Apply a settlement: guarded debit, credit, ledger legs and completion,
    /// all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a conservation anomaly, a missing user or a
    /// balance overflow. Nothing is written in any error case.
    pub async fn settle(&self, command: &SettlementCommand) -> Result<SettleResult, DbError> {
        command.check_conservation()?;

        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get(&command.session_id) else {
            return Ok(SettleResult::NotFound);
        };
        if session.status != SessionStatus::InProgress {
            return Ok(SettleResult::Conflict(session.status));
        }

        // Compute every new value before writing any of them.
        let total = command.amounts.total;
        let new_client_balance = match command.payer {
            Payer::Client(client_id) => {
                let balance = lookup_balance(&inner, client_id)?;
                if balance < total {
                    return Ok(SettleResult::InsufficientFunds {
                        balance,
                        required: total,
                    });
                }
                let remaining = balance
                    .checked_sub(total)
                    .ok_or(DbError::BalanceOverflow(client_id.into_inner()))?;
                Some((client_id, remaining))
            }
            Payer::Gateway => None,
        };
        let provider_balance = lookup_balance(&inner, command.provider_id)?;
        let new_provider_balance = provider_balance
            .checked_add(command.amounts.provider)
            .ok_or(DbError::BalanceOverflow(command.provider_id.into_inner()))?;

        if let Some((client_id, balance)) = new_client_balance {
            set_balance(&mut inner, client_id, balance);
        }
        set_balance(&mut inner, command.provider_id, new_provider_balance);
        inner.ledger.extend(command.entries.iter().cloned());

        let session = inner
            .sessions
            .get_mut(&command.session_id)
            .ok_or(DbError::NotFound {
                entity: "session",
                id: command.session_id.into_inner(),
            })?;
        command.apply(session);
        let session = session.clone();
        inner.settling.remove(&command.session_id);

        Ok(SettleResult::Settled(SettledSession {
            session,
            new_client_balance: new_client_balance.map(|(_, b)| b),
            new_provider_balance,
        }))
    }

    /// Ledger legs recorded for a session.
    pub async fn ledger_for_session(&self, id: SessionId) -> Vec<SettlementEntry> {
        self.inner
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.session_id == id)
            .cloned()
            .collect()
    }
}

fn lookup_balance(inner: &Inner, id: UserId) -> Result<i64, DbError> {
    inner
        .users
        .get(&id)
        .map(|u| u.account_balance)
        .ok_or(DbError::NotFound {
            entity: "user",
            id: id.into_inner(),
        })
}

fn set_balance(inner: &mut Inner, id: UserId, balance: i64) {
    if let Some(user) = inner.users.get_mut(&id) {
        user.account_balance = balance;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Utc;
    use parlor_ledger::{RevenueSplit, settlement_entries};
    use parlor_types::{Role, SessionKind, SessionMode};

    use super::*;

    fn identity(role: Role, balance: i64) -> Identity {
        Identity {
            id: UserId::new(),
            display_name: format!("{role}"),
            role,
            is_online: false,
            account_balance: balance,
        }
    }

    fn session(client: UserId, provider: UserId, status: SessionStatus) -> ReadingSession {
        ReadingSession {
            id: SessionId::new(),
            provider_id: provider,
            client_id: client,
            kind: SessionKind::Chat,
            mode: SessionMode::Scheduled,
            price_per_minute: 100,
            status,
            scheduled_for: None,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            total_cost: None,
            provider_share: None,
            platform_share: None,
            payment_ref: None,
            cancel_reason: None,
            created_at: Utc::now(),
        }
    }

    fn command(s: &ReadingSession, payer: Payer, total: i64) -> SettlementCommand {
        let amounts = RevenueSplit::default().split(total).unwrap();
        SettlementCommand {
            session_id: s.id,
            payer,
            provider_id: s.provider_id,
            duration_seconds: 125,
            amounts,
            entries: settlement_entries(s.id, payer, s.provider_id, &amounts).unwrap(),
            completed_at: Utc::now(),
        }
    }

    async fn seeded(balance: i64) -> (MemoryStore, Identity, Identity, ReadingSession) {
        let store = MemoryStore::new();
        let client = identity(Role::Client, balance);
        let provider = identity(Role::Provider, 0);
        store.insert_identity(client.clone()).await.unwrap();
        store.insert_identity(provider.clone()).await.unwrap();
        let s = session(client.id, provider.id, SessionStatus::InProgress);
        store.insert_session(s.clone()).await.unwrap();
        (store, client, provider, s)
    }

    #[tokio::test]
    async fn settle_debits_and_credits() {
        let (store, client, provider, s) = seeded(500).await;
        let result = store
            .settle(&command(&s, Payer::Client(client.id), 300))
            .await
            .unwrap();
        let SettleResult::Settled(settled) = result else {
            panic!("expected settlement, got {result:?}");
        };
        assert_eq!(settled.new_client_balance, Some(200));
        assert_eq!(settled.new_provider_balance, 240);
        assert_eq!(settled.session.status, SessionStatus::Completed);
        assert_eq!(settled.session.total_cost, Some(300));
        assert_eq!(store.get_identity(provider.id).await.unwrap().account_balance, 240);
        assert_eq!(store.ledger_for_session(s.id).await.len(), 2);
    }

    #[tokio::test]
    async fn insufficient_funds_writes_nothing() {
        let (store, client, provider, s) = seeded(250).await;
        let result = store
            .settle(&command(&s, Payer::Client(client.id), 300))
            .await
            .unwrap();
        assert_eq!(
            result,
            SettleResult::InsufficientFunds {
                balance: 250,
                required: 300
            }
        );
        assert_eq!(store.get_identity(client.id).await.unwrap().account_balance, 250);
        assert_eq!(store.get_identity(provider.id).await.unwrap().account_balance, 0);
        assert_eq!(
            store.get_session(s.id).await.unwrap().status,
            SessionStatus::InProgress
        );
        assert!(store.ledger_for_session(s.id).await.is_empty());
    }

    #[tokio::test]
    async fn settle_twice_conflicts() {
        let (store, client, _provider, s) = seeded(1_000).await;
        let cmd = command(&s, Payer::Client(client.id), 300);
        assert!(matches!(store.settle(&cmd).await, Ok(SettleResult::Settled(_))));
        assert_eq!(
            store.settle(&cmd).await.unwrap(),
            SettleResult::Conflict(SessionStatus::Completed)
        );
        assert_eq!(store.get_identity(client.id).await.unwrap().account_balance, 700);
    }

    #[tokio::test]
    async fn gateway_path_leaves_client_balance_alone() {
        let (store, client, _provider, s) = seeded(0).await;
        let result = store.settle(&command(&s, Payer::Gateway, 300)).await.unwrap();
        assert!(matches!(
            result,
            SettleResult::Settled(SettledSession {
                new_client_balance: None,
                new_provider_balance: 240,
                ..
            })
        ));
        assert_eq!(store.get_identity(client.id).await.unwrap().account_balance, 0);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (store, _client, _provider, s) = seeded(0).await;
        let start = Transition::new(&[SessionStatus::Scheduled], SessionStatus::InProgress);
        assert_eq!(
            store.transition(s.id, &start).await,
            TransitionResult::Conflict(SessionStatus::InProgress)
        );
        let cancel = Transition {
            cancel_reason: Some("client left".to_owned()),
            ..Transition::new(&SessionStatus::NON_TERMINAL, SessionStatus::Cancelled)
        };
        let TransitionResult::Applied(updated) = store.transition(s.id, &cancel).await else {
            panic!("cancel should apply");
        };
        assert_eq!(updated.cancel_reason.as_deref(), Some("client left"));
        assert_eq!(
            store.transition(SessionId::new(), &cancel).await,
            TransitionResult::NotFound
        );
    }

    #[tokio::test]
    async fn claimed_session_refuses_transitions_until_released() {
        let (store, client, _provider, s) = seeded(1_000).await;
        assert!(matches!(
            store.claim_settlement(s.id).await,
            TransitionResult::Applied(_)
        ));
        assert_eq!(
            store.claim_settlement(s.id).await,
            TransitionResult::Conflict(SessionStatus::InProgress)
        );
        let cancel = Transition::new(&SessionStatus::NON_TERMINAL, SessionStatus::Cancelled);
        assert_eq!(
            store.transition(s.id, &cancel).await,
            TransitionResult::Conflict(SessionStatus::InProgress)
        );

        store.release_settlement(s.id).await;
        assert!(matches!(
            store.claim_settlement(s.id).await,
            TransitionResult::Applied(_)
        ));
        let cmd = command(&s, Payer::Client(client.id), 300);
        assert!(matches!(store.settle(&cmd).await, Ok(SettleResult::Settled(_))));
        assert_eq!(
            store.claim_settlement(s.id).await,
            TransitionResult::Conflict(SessionStatus::Completed)
        );
    }
}
