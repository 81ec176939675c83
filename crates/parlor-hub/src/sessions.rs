//! Reading-session state machine.
//!
//! ```text
//! create ──┬─ scheduled ───────────────────────┐
//!          └─ waiting_payment ─ payment_completed ─┴─ in_progress ─ completed
//!                 any non-terminal state ──────────────────────────── cancelled
//! ```
//!
//! Every transition is a compare-and-set in the store, so two racing
//! requests cannot both succeed. A session claimed by a settlement refuses
//! every other transition, `cancel` included, until the claim is dropped.
//! `end` hands off to the settlement engine on
//! a spawned task: once started, a settlement finishes even if the request
//! that triggered it goes away. Both parties receive a `session_updated`
//! frame after every transition and a `session_settled` or
//! `settlement_failed` frame after every settlement attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parlor_db::{SessionFilter, Store, Transition, TransitionResult};
use parlor_types::{
    Identity, ReadingSession, Role, ServerFrame, SessionId, SessionKind, SessionMode,
    SessionStatus, UserId,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::authz::{Action, authorize};
use crate::error::HubError;
use crate::gateway::PaymentGateway;
use crate::registry::Registry;
use crate::settlement::{Settlement, SettlementEngine};

/// Reason recorded when the gateway reports a failed payment.
pub const PAYMENT_FAILED_REASON: &str = "payment_failed";

/// Reason recorded when policy cancels an unpayable session.
pub const INSUFFICIENT_FUNDS_REASON: &str = "insufficient_funds";

/// A client's request for a reading.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    /// The provider to book.
    pub provider_id: UserId,
    /// Chat, voice or video.
    pub kind: SessionKind,
    /// Scheduled or on demand.
    pub mode: SessionMode,
    /// Agreed price per started minute, in minor units.
    pub price_per_minute: i64,
    /// Booked start, for scheduled readings.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Optional list criteria from the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessions {
    /// Only sessions of this client.
    #[serde(default)]
    pub client_id: Option<UserId>,
    /// Only sessions of this provider.
    #[serde(default)]
    pub provider_id: Option<UserId>,
    /// Only sessions in this state.
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

/// Drives session transitions.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    store: Store,
    registry: Arc<Registry>,
    engine: SettlementEngine,
    gateway: PaymentGateway,
    cancel_on_insufficient_funds: bool,
}

impl SessionMachine {
    /// Create a state machine.
    pub const fn new(
        store: Store,
        registry: Arc<Registry>,
        engine: SettlementEngine,
        gateway: PaymentGateway,
        cancel_on_insufficient_funds: bool,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            gateway,
            cancel_on_insufficient_funds,
        }
    }

    /// Create a session for `caller`, who becomes its client.
    ///
    /// Scheduled sessions start in `scheduled`. On-demand sessions start in
    /// `waiting_payment` and require the provider to be online.
    pub async fn create(
        &self,
        caller: &Identity,
        request: &CreateSession,
    ) -> Result<ReadingSession, HubError> {
        if caller.role != Role::Client {
            return Err(HubError::Forbidden(format!(
                "only clients may book readings, {} is a {}",
                caller.id, caller.role
            )));
        }
        if request.price_per_minute < 0 {
            return Err(HubError::Validation(
                "pricePerMinute must not be negative".to_owned(),
            ));
        }
        if request.provider_id == caller.id {
            return Err(HubError::Validation(
                "a client cannot book themselves".to_owned(),
            ));
        }
        let provider = self
            .store
            .get_identity(request.provider_id)
            .await?
            .ok_or_else(|| HubError::user_not_found(request.provider_id))?;
        if !provider.is_provider() {
            return Err(HubError::Validation(format!(
                "user {} is not a provider",
                provider.id
            )));
        }

        let status = match request.mode {
            SessionMode::Scheduled => SessionStatus::Scheduled,
            SessionMode::OnDemand if provider.is_online => SessionStatus::WaitingPayment,
            SessionMode::OnDemand => return Err(HubError::ProviderOffline(provider.id)),
        };

        let session = ReadingSession {
            id: SessionId::new(),
            provider_id: provider.id,
            client_id: caller.id,
            kind: request.kind,
            mode: request.mode,
            price_per_minute: request.price_per_minute,
            status,
            scheduled_for: request.scheduled_for,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            total_cost: None,
            provider_share: None,
            platform_share: None,
            payment_ref: None,
            cancel_reason: None,
            created_at: Utc::now(),
        };
        self.store.insert_session(session.clone()).await?;
        info!(
            session_id = %session.id,
            client_id = %session.client_id,
            provider_id = %session.provider_id,
            status = %session.status,
            "session created"
        );
        self.notify_parties(&session, &ServerFrame::SessionUpdated {
            session: session.clone(),
        })
        .await;
        Ok(session)
    }

    /// Fetch a session the caller may view.
    pub async fn get(&self, caller: &Identity, id: SessionId) -> Result<ReadingSession, HubError> {
        let session = self.load(id).await?;
        authorize(caller, &session, Action::View)?;
        Ok(session)
    }

    /// List sessions visible to the caller. Non-admins only ever see
    /// sessions they are party to.
    pub async fn list(
        &self,
        caller: &Identity,
        query: ListSessions,
    ) -> Result<Vec<ReadingSession>, HubError> {
        let filter = SessionFilter {
            party: (!caller.is_admin()).then_some(caller.id),
            client_id: query.client_id,
            provider_id: query.provider_id,
            status: query.status,
        };
        Ok(self.store.list_sessions(&filter).await?)
    }

    /// `waiting_payment -> payment_completed`, recording the payment intent.
    pub async fn confirm_payment(
        &self,
        caller: &Identity,
        id: SessionId,
        payment_ref: &str,
    ) -> Result<ReadingSession, HubError> {
        if payment_ref.trim().is_empty() {
            return Err(HubError::Validation("paymentRef must not be empty".to_owned()));
        }
        let session = self.load(id).await?;
        authorize(caller, &session, Action::ConfirmPayment)?;
        let transition = Transition {
            payment_ref: Some(payment_ref.to_owned()),
            ..Transition::new(&[SessionStatus::WaitingPayment], SessionStatus::PaymentCompleted)
        };
        self.apply(id, &transition).await
    }

    /// `waiting_payment -> cancelled` after a failed payment.
    pub async fn fail_payment(
        &self,
        caller: &Identity,
        id: SessionId,
    ) -> Result<ReadingSession, HubError> {
        let session = self.load(id).await?;
        authorize(caller, &session, Action::FailPayment)?;
        let transition = Transition {
            cancel_reason: Some(PAYMENT_FAILED_REASON.to_owned()),
            ..Transition::new(&[SessionStatus::WaitingPayment], SessionStatus::Cancelled)
        };
        self.apply(id, &transition).await
    }

    /// `{scheduled, payment_completed} -> in_progress`, stamping `started_at`.
    pub async fn start(&self, caller: &Identity, id: SessionId) -> Result<ReadingSession, HubError> {
        let session = self.load(id).await?;
        authorize(caller, &session, Action::Start)?;
        let transition = Transition {
            started_at: Some(Utc::now()),
            ..Transition::new(
                &[SessionStatus::Scheduled, SessionStatus::PaymentCompleted],
                SessionStatus::InProgress,
            )
        };
        self.apply(id, &transition).await
    }

    /// `in_progress -> completed` through the settlement engine.
    ///
    /// The settlement runs on its own task; dropping the returned future
    /// does not abandon it.
    pub async fn end(
        &self,
        caller: &Identity,
        id: SessionId,
        duration_seconds: u32,
    ) -> Result<Settlement, HubError> {
        let session = self.load(id).await?;
        authorize(caller, &session, Action::End)?;
        if session.status != SessionStatus::InProgress {
            return Err(HubError::Conflict {
                current: session.status,
            });
        }

        let machine = self.clone();
        let task = tokio::spawn(async move {
            machine
                .settle_and_notify(&session, duration_seconds)
                .await
        });
        task.await
            .map_err(|e| HubError::Internal(format!("settlement task failed: {e}")))?
    }

    /// Any non-terminal state `-> cancelled`. A paid session's payment
    /// intent is refunded. A session being settled cannot be cancelled, so
    /// the refund never races a capture.
    pub async fn cancel(
        &self,
        caller: &Identity,
        id: SessionId,
        reason: Option<String>,
    ) -> Result<ReadingSession, HubError> {
        let session = self.load(id).await?;
        authorize(caller, &session, Action::Cancel)?;
        let transition = Transition {
            cancel_reason: reason,
            ..Transition::new(&SessionStatus::NON_TERMINAL, SessionStatus::Cancelled)
        };
        let cancelled = self.apply(id, &transition).await?;
        self.refund_if_paid(&cancelled).await;
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load(&self, id: SessionId) -> Result<ReadingSession, HubError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| HubError::session_not_found(id))
    }

    /// Run one compare-and-set transition and announce the result.
    async fn apply(&self, id: SessionId, transition: &Transition) -> Result<ReadingSession, HubError> {
        match self.store.transition(id, transition).await? {
            TransitionResult::Applied(session) => {
                info!(session_id = %id, status = %session.status, "session transitioned");
                self.notify_parties(&session, &ServerFrame::SessionUpdated {
                    session: session.clone(),
                })
                .await;
                Ok(session)
            }
            TransitionResult::Conflict(current) => {
                debug!(session_id = %id, current = %current, to = %transition.to, "transition rejected");
                Err(HubError::Conflict { current })
            }
            TransitionResult::NotFound => Err(HubError::session_not_found(id)),
        }
    }

    async fn settle_and_notify(
        &self,
        session: &ReadingSession,
        duration_seconds: u32,
    ) -> Result<Settlement, HubError> {
        match self.engine.settle(session.id, duration_seconds).await {
            Ok(settlement) => {
                self.notify_parties(&settlement.session, &ServerFrame::SessionSettled {
                    session_id: session.id,
                    total_cost: settlement.amounts.total,
                    provider_share: settlement.amounts.provider,
                    platform_share: settlement.amounts.platform,
                    path: settlement.path.kind(),
                    new_client_balance: settlement.path.new_client_balance(),
                })
                .await;
                self.notify_parties(&settlement.session, &ServerFrame::SessionUpdated {
                    session: settlement.session.clone(),
                })
                .await;
                Ok(settlement)
            }
            Err(err) => {
                self.settlement_failed(session, &err).await;
                Err(err)
            }
        }
    }

    async fn settlement_failed(&self, session: &ReadingSession, err: &HubError) {
        // A lost race with another `end` or `cancel` is not a failed payment.
        if matches!(err, HubError::Conflict { .. } | HubError::NotFound { .. }) {
            return;
        }
        warn!(
            session_id = %session.id,
            reason = err.reason(),
            error = %err,
            "settlement failed"
        );
        self.notify_parties(session, &ServerFrame::SettlementFailed {
            session_id: session.id,
            reason: err.reason().to_owned(),
            shortfall: err.shortfall(),
        })
        .await;

        if self.cancel_on_insufficient_funds && matches!(err, HubError::InsufficientFunds { .. }) {
            let transition = Transition {
                cancel_reason: Some(INSUFFICIENT_FUNDS_REASON.to_owned()),
                ..Transition::new(&[SessionStatus::InProgress], SessionStatus::Cancelled)
            };
            match self.apply(session.id, &transition).await {
                Ok(_) => info!(session_id = %session.id, "unpaid session cancelled by policy"),
                Err(e) => warn!(session_id = %session.id, error = %e, "policy cancel failed"),
            }
        }
    }

    async fn refund_if_paid(&self, session: &ReadingSession) {
        let Some(payment_ref) = &session.payment_ref else {
            return;
        };
        match self.gateway.refund(payment_ref).await {
            Ok(()) => info!(
                session_id = %session.id,
                payment_ref = payment_ref.as_str(),
                "payment refunded for cancelled session"
            ),
            Err(e) => error!(
                session_id = %session.id,
                payment_ref = payment_ref.as_str(),
                error = %e,
                "refund failed for cancelled session"
            ),
        }
    }

    /// Send `frame` to every connection of both parties.
    async fn notify_parties(&self, session: &ReadingSession, frame: &ServerFrame) {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "failed to serialize session frame");
                return;
            }
        };
        for user in [session.client_id, session.provider_id] {
            let reached = self.registry.send_to_user(user, &text).await;
            if reached == 0 {
                debug!(session_id = %session.id, user_id = %user, "party offline, notification dropped");
            }
        }
    }
}
