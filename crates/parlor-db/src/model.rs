//! Commands and outcomes shared by every store backend.

use chrono::{DateTime, Utc};
use parlor_ledger::conservation::{ConservationResult, verify_settlement};
use parlor_ledger::{Payer, SplitAmounts};
use parlor_types::{ReadingSession, SessionId, SessionStatus, SettlementEntry, UserId};

use crate::error::DbError;

/// Criteria for listing sessions. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Sessions where this user is the client or the provider.
    pub party: Option<UserId>,
    /// Sessions of this client.
    pub client_id: Option<UserId>,
    /// Sessions of this provider.
    pub provider_id: Option<UserId>,
    /// Sessions in this state.
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    /// Whether `session` satisfies every set criterion.
    pub fn matches(&self, session: &ReadingSession) -> bool {
        self.party.is_none_or(|u| session.is_party(u))
            && self.client_id.is_none_or(|u| session.client_id == u)
            && self.provider_id.is_none_or(|u| session.provider_id == u)
            && self.status.is_none_or(|s| session.status == s)
    }
}

/// A compare-and-set status change for every transition except settlement.
///
/// A session claimed for settlement refuses every transition until the
/// claim is released or the settlement completes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// States the session must currently be in.
    pub allowed_from: Vec<SessionStatus>,
    /// Target state.
    pub to: SessionStatus,
    /// Stamped on `start`.
    pub started_at: Option<DateTime<Utc>>,
    /// Recorded on payment confirmation.
    pub payment_ref: Option<String>,
    /// Recorded on cancellation.
    pub cancel_reason: Option<String>,
}

impl Transition {
    /// A bare transition from `allowed_from` to `to`.
    pub fn new(allowed_from: &[SessionStatus], to: SessionStatus) -> Self {
        Self {
            allowed_from: allowed_from.to_vec(),
            to,
            started_at: None,
            payment_ref: None,
            cancel_reason: None,
        }
    }

    /// Apply the patch to an in-memory row. The caller has checked the status.
    pub(crate) fn apply(&self, session: &mut ReadingSession) {
        session.status = self.to;
        if let Some(at) = self.started_at {
            session.started_at = Some(at);
        }
        if let Some(reference) = &self.payment_ref {
            session.payment_ref = Some(reference.clone());
        }
        if let Some(reason) = &self.cancel_reason {
            session.cancel_reason = Some(reason.clone());
        }
    }
}

/// Outcome of a [`Transition`] or a settlement claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The row was updated; carries the new state.
    Applied(ReadingSession),
    /// The session was not in an allowed state, or a settlement holds it;
    /// nothing changed.
    Conflict(SessionStatus),
    /// No such session.
    NotFound,
}

/// Everything needed to apply one settlement atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementCommand {
    /// The session being completed.
    pub session_id: SessionId,
    /// Who pays: the client's balance or a captured gateway payment.
    pub payer: Payer,
    /// Provider to credit.
    pub provider_id: UserId,
    /// Billed duration.
    pub duration_seconds: u32,
    /// Frozen amounts.
    pub amounts: SplitAmounts,
    /// Ledger legs recording the movement.
    pub entries: Vec<SettlementEntry>,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}

impl SettlementCommand {
    /// Refuse to write legs that do not match the amounts.
    pub(crate) fn check_conservation(&self) -> Result<(), DbError> {
        match verify_settlement(self.session_id, &self.entries, &self.amounts) {
            ConservationResult::Balanced => Ok(()),
            ConservationResult::Anomaly(anomaly) => Err(DbError::Anomaly(anomaly.message)),
        }
    }

    /// Freeze the cost fields and complete an in-memory row.
    pub(crate) fn apply(&self, session: &mut ReadingSession) {
        session.status = SessionStatus::Completed;
        session.completed_at = Some(self.completed_at);
        session.duration_seconds = Some(self.duration_seconds);
        session.total_cost = Some(self.amounts.total);
        session.provider_share = Some(self.amounts.provider);
        session.platform_share = Some(self.amounts.platform);
    }
}

/// Balances and row after a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledSession {
    /// The completed session with its frozen cost.
    pub session: ReadingSession,
    /// Client balance after the debit; `None` on the gateway path.
    pub new_client_balance: Option<i64>,
    /// Provider balance after the credit.
    pub new_provider_balance: i64,
}

/// Outcome of a settlement attempt. Every non-`Settled` outcome left the
/// store untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResult {
    /// Balances, ledger and session were all written.
    Settled(SettledSession),
    /// The client cannot cover the cost.
    InsufficientFunds {
        /// Balance at the time of the check.
        balance: i64,
        /// Frozen total cost.
        required: i64,
    },
    /// The session is no longer `in_progress`.
    Conflict(SessionStatus),
    /// No such session.
    NotFound,
}
