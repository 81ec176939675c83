//! Settlement engine: turns an ended session into money movement.
//!
//! One entry point, [`SettlementEngine::settle`], covers both payment paths.
//! A session carrying a `payment_ref` captures the pre-authorized gateway
//! payment; any other session debits the client's balance. Either way the
//! frozen cost, the split and the terminal state are identical, and the
//! caller receives a tagged [`Settlement`].
//!
//! Settlement is all-or-nothing. The session is first claimed in the store,
//! which shuts out concurrent `end` and `cancel` calls; only the claim holder
//! captures. The store then applies debit, credit, ledger legs and the
//! `completed` transition in one atomic unit, bounded by the configured store
//! timeout. A capture followed by a failed store write is refunded.

use std::time::Duration;

use chrono::Utc;
use parlor_db::{SettleResult, SettledSession, SettlementCommand, Store, TransitionResult};
use parlor_ledger::{Payer, RevenueSplit, SplitAmounts, settlement_entries, total_cost};
use parlor_types::{ReadingSession, SessionId, SettlementPathKind};
use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::error::HubError;
use crate::gateway::PaymentGateway;

/// How a settlement was paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementPath {
    /// Debited from the client's internal balance.
    Balance {
        /// Client balance after the debit.
        new_client_balance: i64,
    },
    /// Captured from the pre-authorized payment intent.
    Gateway {
        /// The captured intent.
        payment_ref: String,
    },
}

impl SettlementPath {
    /// The wire tag of this path.
    pub const fn kind(&self) -> SettlementPathKind {
        match self {
            Self::Balance { .. } => SettlementPathKind::Balance,
            Self::Gateway { .. } => SettlementPathKind::Gateway,
        }
    }

    /// Client balance after a balance debit.
    pub const fn new_client_balance(&self) -> Option<i64> {
        match self {
            Self::Balance { new_client_balance } => Some(*new_client_balance),
            Self::Gateway { .. } => None,
        }
    }
}

/// A committed settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// The session, now `completed` with its cost frozen.
    pub session: ReadingSession,
    /// Total, provider and platform amounts.
    pub amounts: SplitAmounts,
    /// Which payment path was taken.
    pub path: SettlementPath,
    /// Provider balance after the credit.
    pub new_provider_balance: i64,
}

/// Computes and applies settlements.
#[derive(Debug, Clone)]
pub struct SettlementEngine {
    store: Store,
    gateway: PaymentGateway,
    split: RevenueSplit,
    store_timeout: Duration,
}

impl SettlementEngine {
    /// Create an engine over `store` and `gateway`.
    pub fn new(store: Store, gateway: PaymentGateway, config: &SettlementConfig) -> Self {
        Self {
            store,
            gateway,
            split: config.provider_share,
            store_timeout: config.store_timeout(),
        }
    }

    /// The revenue split applied to every settlement.
    pub const fn split(&self) -> RevenueSplit {
        self.split
    }

    /// Settle session `id` for `duration_seconds`.
    ///
    /// The session is claimed in the store before anything else happens, so
    /// of several concurrent calls exactly one reaches the gateway. Every
    /// failure that leaves the session `in_progress` drops the claim again.
    ///
    /// # Errors
    ///
    /// - [`HubError::Conflict`] when the session is not `in_progress` or
    ///   another settlement holds it
    /// - [`HubError::InsufficientFunds`] when the client cannot cover the
    ///   cost; nothing was written
    /// - [`HubError::Gateway`] when the capture fails; nothing was written
    /// - [`HubError::Timeout`] when the store did not answer in time
    pub async fn settle(&self, id: SessionId, duration_seconds: u32) -> Result<Settlement, HubError> {
        let session = self.claim(id).await?;
        let command = match self.command(&session, duration_seconds) {
            Ok(command) => command,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };

        let captured = match session.payment_ref.as_deref() {
            Some(payment_ref) if command.amounts.total > 0 => {
                if let Err(e) = self.gateway.capture(payment_ref, command.amounts.total).await {
                    self.release(id).await;
                    return Err(e.into());
                }
                Some(payment_ref)
            }
            _ => None,
        };

        let settled = self.write(&command, captured).await?;
        let path = match (&session.payment_ref, settled.new_client_balance) {
            (Some(payment_ref), _) => SettlementPath::Gateway {
                payment_ref: payment_ref.clone(),
            },
            (None, Some(new_client_balance)) => SettlementPath::Balance { new_client_balance },
            (None, None) => {
                return Err(HubError::Internal(
                    "balance settlement returned no client balance".to_owned(),
                ));
            }
        };

        let amounts = command.amounts;
        info!(
            session_id = %id,
            duration_seconds,
            total = amounts.total,
            provider = amounts.provider,
            platform = amounts.platform,
            path = ?path.kind(),
            "session settled"
        );

        Ok(Settlement {
            session: settled.session,
            amounts,
            path,
            new_provider_balance: settled.new_provider_balance,
        })
    }

    /// Apply `command` in the store. `captured` names the payment already
    /// taken for it, refunded only if the write itself failed.
    async fn write(
        &self,
        command: &SettlementCommand,
        captured: Option<&str>,
    ) -> Result<SettledSession, HubError> {
        let id = command.session_id;
        let outcome = match tokio::time::timeout(self.store_timeout, self.store.settle(command)).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(payment_ref) = captured {
                    // The claim stays so nothing else touches the session.
                    error!(
                        session_id = %id,
                        payment_ref,
                        "settlement store write timed out after capture; outcome needs reconciliation"
                    );
                } else {
                    self.release(id).await;
                }
                return Err(HubError::Timeout("settlement store write"));
            }
        };

        match outcome {
            Ok(SettleResult::Settled(settled)) => Ok(settled),
            Ok(SettleResult::InsufficientFunds { balance, required }) => {
                self.release(id).await;
                Err(HubError::InsufficientFunds { balance, required })
            }
            Ok(SettleResult::Conflict(current)) => {
                // Whatever moved the session on owns its payment.
                warn!(session_id = %id, current = %current, "claimed session changed under settlement");
                self.release(id).await;
                Err(HubError::Conflict { current })
            }
            Ok(SettleResult::NotFound) => {
                if let Some(payment_ref) = captured {
                    self.refund_capture(id, payment_ref).await;
                }
                Err(HubError::session_not_found(id))
            }
            Err(e) => {
                if let Some(payment_ref) = captured {
                    self.refund_capture(id, payment_ref).await;
                }
                self.release(id).await;
                Err(e.into())
            }
        }
    }

    async fn claim(&self, id: SessionId) -> Result<ReadingSession, HubError> {
        match self.store.claim_settlement(id).await? {
            TransitionResult::Applied(session) => Ok(session),
            TransitionResult::Conflict(current) => {
                debug!(session_id = %id, current = %current, "settlement claim refused");
                Err(HubError::Conflict { current })
            }
            TransitionResult::NotFound => Err(HubError::session_not_found(id)),
        }
    }

    async fn release(&self, id: SessionId) {
        if let Err(e) = self.store.release_settlement(id).await {
            error!(session_id = %id, error = %e, "failed to release settlement claim");
        }
    }

    /// Freeze the cost of a claimed session.
    fn command(
        &self,
        session: &ReadingSession,
        duration_seconds: u32,
    ) -> Result<SettlementCommand, HubError> {
        let total = total_cost(duration_seconds, session.price_per_minute)?;
        let amounts = self.split.split(total)?;
        let payer = if session.payment_ref.is_some() {
            Payer::Gateway
        } else {
            Payer::Client(session.client_id)
        };
        Ok(SettlementCommand {
            session_id: session.id,
            payer,
            provider_id: session.provider_id,
            duration_seconds,
            amounts,
            entries: settlement_entries(session.id, payer, session.provider_id, &amounts)?,
            completed_at: Utc::now(),
        })
    }

    /// Undo a capture whose store write failed.
    async fn refund_capture(&self, id: SessionId, payment_ref: &str) {
        match self.gateway.refund(payment_ref).await {
            Ok(()) => warn!(
                session_id = %id,
                payment_ref,
                "capture refunded after failed settlement write"
            ),
            Err(e) => error!(
                session_id = %id,
                payment_ref,
                error = %e,
                "failed to refund capture after failed settlement write"
            ),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects
)]
mod tests {
    use parlor_types::{Identity, Role, SessionKind, SessionMode, SessionStatus, UserId};

    use super::*;
    use crate::gateway::LocalGateway;

    struct Fixture {
        engine: SettlementEngine,
        store: Store,
        gateway: LocalGateway,
        session: ReadingSession,
    }

    async fn fixture(balance: i64, payment_ref: Option<&str>) -> Fixture {
        let store = Store::memory();
        let client = Identity {
            id: UserId::new(),
            display_name: "client".to_owned(),
            role: Role::Client,
            is_online: false,
            account_balance: balance,
        };
        let provider = Identity {
            id: UserId::new(),
            display_name: "provider".to_owned(),
            role: Role::Provider,
            is_online: true,
            account_balance: 0,
        };
        store.insert_identity(client.clone()).await.unwrap();
        store.insert_identity(provider.clone()).await.unwrap();
        let session = ReadingSession {
            id: SessionId::new(),
            provider_id: provider.id,
            client_id: client.id,
            kind: SessionKind::Voice,
            mode: SessionMode::OnDemand,
            price_per_minute: 100,
            status: SessionStatus::InProgress,
            scheduled_for: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_seconds: None,
            total_cost: None,
            provider_share: None,
            platform_share: None,
            payment_ref: payment_ref.map(ToOwned::to_owned),
            cancel_reason: None,
            created_at: Utc::now(),
        };
        store.insert_session(session.clone()).await.unwrap();
        let gateway = LocalGateway::new();
        let engine = SettlementEngine::new(
            store.clone(),
            PaymentGateway::Local(gateway.clone()),
            &SettlementConfig::default(),
        );
        Fixture {
            engine,
            store,
            gateway,
            session,
        }
    }

    #[tokio::test]
    async fn balance_path_freezes_cost_and_splits() {
        let f = fixture(500, None).await;
        let settlement = f.engine.settle(f.session.id, 125).await.unwrap();
        assert_eq!(
            settlement.amounts,
            SplitAmounts {
                total: 300,
                provider: 240,
                platform: 60
            }
        );
        assert_eq!(settlement.path, SettlementPath::Balance { new_client_balance: 200 });
        assert_eq!(settlement.session.status, SessionStatus::Completed);
        assert_eq!(settlement.session.total_cost, Some(300));
        assert!(f.gateway.captures().await.is_empty());
    }

    #[tokio::test]
    async fn frozen_cost_matches_ceiling_minutes() {
        for (seconds, expected) in [(1, 100), (59, 100), (60, 100), (61, 200), (3599, 6000), (3600, 6000)] {
            let f = fixture(1_000_000, None).await;
            let settlement = f.engine.settle(f.session.id, seconds).await.unwrap();
            assert_eq!(settlement.session.total_cost, Some(expected), "{seconds}s");
            assert!(settlement.amounts.reconciles());
        }
    }

    #[tokio::test]
    async fn insufficient_funds_aborts_without_mutation() {
        let f = fixture(250, None).await;
        let err = f.engine.settle(f.session.id, 125).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::InsufficientFunds {
                balance: 250,
                required: 300
            }
        ));
        let after = f.store.get_session(f.session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::InProgress);
        let client = f.store.get_identity(f.session.client_id).await.unwrap().unwrap();
        assert_eq!(client.account_balance, 250);
    }

    #[tokio::test]
    async fn gateway_path_captures_frozen_total() {
        let f = fixture(0, Some("pi_42")).await;
        let settlement = f.engine.settle(f.session.id, 125).await.unwrap();
        assert_eq!(
            settlement.path,
            SettlementPath::Gateway {
                payment_ref: "pi_42".to_owned()
            }
        );
        assert_eq!(settlement.path.new_client_balance(), None);
        assert_eq!(settlement.session.total_cost, Some(300));
        assert_eq!(f.gateway.captures().await, vec![("pi_42".to_owned(), 300)]);
        assert_eq!(settlement.new_provider_balance, 240);
    }

    #[tokio::test]
    async fn declined_capture_leaves_session_in_progress() {
        let f = fixture(0, Some("pi_7")).await;
        f.gateway.set_declining(true).await;
        let err = f.engine.settle(f.session.id, 60).await.unwrap_err();
        assert!(matches!(err, HubError::Gateway(_)));
        let after = f.store.get_session(f.session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::InProgress);

        // The claim was dropped, so a later attempt goes through.
        f.gateway.set_declining(false).await;
        let settlement = f.engine.settle(f.session.id, 60).await.unwrap();
        assert_eq!(settlement.session.status, SessionStatus::Completed);
        assert_eq!(f.gateway.captures().await, vec![("pi_7".to_owned(), 100)]);
    }

    #[tokio::test]
    async fn settling_a_completed_session_neither_captures_nor_refunds() {
        let f = fixture(0, Some("pi_9")).await;
        f.engine.settle(f.session.id, 60).await.unwrap();
        let err = f.engine.settle(f.session.id, 60).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::Conflict {
                current: SessionStatus::Completed
            }
        ));
        assert_eq!(f.gateway.captures().await, vec![("pi_9".to_owned(), 100)]);
        assert!(f.gateway.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_gateway_settlements_capture_once() {
        let f = fixture(0, Some("pi_1")).await;
        let (a, b) = tokio::join!(
            f.engine.settle(f.session.id, 60),
            f.engine.settle(f.session.id, 60)
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(HubError::Conflict { .. })));

        let after = f.store.get_session(f.session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert_eq!(after.total_cost, Some(100));
        assert_eq!(f.gateway.captures().await, vec![("pi_1".to_owned(), 100)]);
        assert!(f.gateway.refunds().await.is_empty());
        let provider = f.store.get_identity(f.session.provider_id).await.unwrap().unwrap();
        assert_eq!(provider.account_balance, 80);
    }

    #[tokio::test]
    async fn failed_store_write_refunds_capture_and_releases_claim() {
        let f = fixture(0, Some("pi_5")).await;
        // A provider missing from the store makes the credit fail after capture.
        let orphan = ReadingSession {
            id: SessionId::new(),
            provider_id: UserId::new(),
            ..f.session.clone()
        };
        f.store.insert_session(orphan.clone()).await.unwrap();

        let err = f.engine.settle(orphan.id, 60).await.unwrap_err();
        assert!(matches!(err, HubError::Store(_)));
        assert_eq!(f.gateway.captures().await, vec![("pi_5".to_owned(), 100)]);
        assert_eq!(f.gateway.refunds().await, vec!["pi_5".to_owned()]);
        assert!(matches!(
            f.store.claim_settlement(orphan.id).await.unwrap(),
            TransitionResult::Applied(_)
        ));
    }
}
