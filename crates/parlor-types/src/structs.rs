//! Core entity structs: identities, reading sessions and settlement rows.
//!
//! All money values are integers in minor currency units (cents). Nothing
//! in the workspace represents money as a float.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{LedgerAccount, Role, SessionKind, SessionMode, SessionStatus};
use crate::ids::{LedgerEntryId, SessionId, UserId};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The subset of a user record the hub depends on.
///
/// Owned by the identity store. The hub reads it per request and issues
/// balance deltas; it never keeps a writable copy around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Identity {
    /// User id.
    pub id: UserId,
    /// Name shown to the other party.
    pub display_name: String,
    /// Client, provider or admin.
    pub role: Role,
    /// Presence flag, maintained from connection churn for providers.
    pub is_online: bool,
    /// Spendable balance in minor units. Never negative.
    #[ts(type = "number")]
    pub account_balance: i64,
}

impl Identity {
    /// Whether this identity may act on any session regardless of party.
    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Whether this identity gives readings.
    pub const fn is_provider(&self) -> bool {
        matches!(self.role, Role::Provider)
    }
}

// ---------------------------------------------------------------------------
// Reading session
// ---------------------------------------------------------------------------

/// A billed real-time interaction between a client and a provider.
///
/// Sessions are created by a client request, mutated only by the session
/// state machine and never deleted. `total_cost`, `provider_share` and
/// `platform_share` are written exactly once, by the transition into
/// [`SessionStatus::Completed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ReadingSession {
    /// Session id.
    pub id: SessionId,
    /// The provider giving the reading.
    pub provider_id: UserId,
    /// The client paying for it.
    pub client_id: UserId,
    /// Chat, voice or video.
    pub kind: SessionKind,
    /// Scheduled or on demand.
    pub mode: SessionMode,
    /// Price per started minute, in minor units.
    #[ts(type = "number")]
    pub price_per_minute: i64,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Booked start time for scheduled readings.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// When the reading went live.
    pub started_at: Option<DateTime<Utc>>,
    /// When the reading was settled.
    pub completed_at: Option<DateTime<Utc>>,
    /// Billed duration reported at the end.
    pub duration_seconds: Option<u32>,
    /// Frozen cost: `ceil(duration_seconds / 60) * price_per_minute`.
    #[ts(type = "number | null")]
    pub total_cost: Option<i64>,
    /// Part of `total_cost` credited to the provider.
    #[ts(type = "number | null")]
    pub provider_share: Option<i64>,
    /// Part of `total_cost` kept by the platform.
    #[ts(type = "number | null")]
    pub platform_share: Option<i64>,
    /// External payment intent reference for pre-authorized sessions.
    pub payment_ref: Option<String>,
    /// Why the session was cancelled, if it was.
    pub cancel_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ReadingSession {
    /// Whether `user` is the client or the provider of this session.
    pub fn is_party(&self, user: UserId) -> bool {
        self.client_id == user || self.provider_id == user
    }

    /// The other party of the session, if `user` is one of them.
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        if user == self.client_id {
            Some(self.provider_id)
        } else if user == self.provider_id {
            Some(self.client_id)
        } else {
            None
        }
    }

    /// Name of the channel peers subscribe to for this session's traffic.
    pub fn channel(&self) -> String {
        session_channel(self.id)
    }
}

/// Channel name carrying the traffic of one session: `session:<id>`.
pub fn session_channel(id: SessionId) -> String {
    format!("session:{id}")
}

/// Channel carrying provider online/offline events.
pub const PRESENCE_CHANNEL: &str = "presence";

// ---------------------------------------------------------------------------
// Settlement ledger
// ---------------------------------------------------------------------------

/// One leg of a settlement, recorded double-entry style.
///
/// A balance-paid settlement produces `client -> provider` and
/// `client -> platform`; a gateway-captured one produces
/// `gateway -> provider` and `gateway -> platform`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SettlementEntry {
    /// Row id.
    pub id: LedgerEntryId,
    /// The settled session.
    pub session_id: SessionId,
    /// Debited account.
    pub from_account: LedgerAccount,
    /// Debited user, for user-owned accounts.
    pub from_user: Option<UserId>,
    /// Credited account.
    pub to_account: LedgerAccount,
    /// Credited user, for user-owned accounts.
    pub to_user: Option<UserId>,
    /// Amount moved, in minor units. Always positive.
    #[ts(type = "number")]
    pub amount: i64,
    /// Real-world timestamp.
    pub created_at: DateTime<Utc>,
}
