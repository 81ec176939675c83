//! Enumeration types shared by the hub, the store and the HTTP surface.
//!
//! Every enum serializes as `snake_case`, which is also the representation
//! stored in `PostgreSQL` text columns (see [`SessionStatus::as_str`] and
//! friends).

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Error returned when a stored or wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

impl core::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "unknown {} value: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Generates `as_str` and `FromStr` for a fieldless enum using its
/// `snake_case` wire names.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Return the `snake_case` name used on the wire and in the database.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// What a user is allowed to do in the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Role {
    /// Buys readings.
    Client,
    /// Gives readings and earns the provider share.
    Provider,
    /// Operates the platform; may act on any session.
    Admin,
}

string_enum!(Role, "role", {
    Client => "client",
    Provider => "provider",
    Admin => "admin",
});

// ---------------------------------------------------------------------------
// Reading sessions
// ---------------------------------------------------------------------------

/// Medium of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionKind {
    /// Text chat.
    Chat,
    /// Audio call.
    Voice,
    /// Video call.
    Video,
}

string_enum!(SessionKind, "session kind", {
    Chat => "chat",
    Voice => "voice",
    Video => "video",
});

/// How a reading was booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionMode {
    /// Booked ahead of time; billed from the client's balance at the end.
    Scheduled,
    /// Started right away with an online provider; paid through a payment link first.
    OnDemand,
}

string_enum!(SessionMode, "session mode", {
    Scheduled => "scheduled",
    OnDemand => "on_demand",
});

/// Lifecycle state of a reading session.
///
/// ```text
/// scheduled ─────────────────────────┐
///                                     ├─ start ─> in_progress ─ end ─> completed
/// waiting_payment ─> payment_completed┘
///
/// any non-terminal state ─ cancel / payment failure ─> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionStatus {
    /// Booked, waiting for its start.
    Scheduled,
    /// On-demand session waiting for the client to pay the payment link.
    WaitingPayment,
    /// Payment link confirmed; the reading may start.
    PaymentCompleted,
    /// The reading is live.
    InProgress,
    /// Ended and settled. Terminal.
    Completed,
    /// Called off before settlement. Terminal.
    Cancelled,
}

string_enum!(SessionStatus, "session status", {
    Scheduled => "scheduled",
    WaitingPayment => "waiting_payment",
    PaymentCompleted => "payment_completed",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl SessionStatus {
    /// Whether no further transition may leave this state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// All states a session can still be cancelled from.
    pub const NON_TERMINAL: [Self; 4] = [
        Self::Scheduled,
        Self::WaitingPayment,
        Self::PaymentCompleted,
        Self::InProgress,
    ];
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The party on one side of a settlement ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum LedgerAccount {
    /// The client's internal balance.
    Client,
    /// The provider's internal balance.
    Provider,
    /// Platform revenue.
    Platform,
    /// Funds captured on the external payment gateway.
    Gateway,
}

string_enum!(LedgerAccount, "ledger account", {
    Client => "client",
    Provider => "provider",
    Platform => "platform",
    Gateway => "gateway",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        for status in SessionStatus::NON_TERMINAL {
            assert!(!status.is_terminal(), "{status} must not be terminal");
        }
    }

    #[test]
    fn wire_names_match_serde() {
        let json = serde_json::to_string(&SessionStatus::PaymentCompleted).unwrap_or_default();
        assert_eq!(json, "\"payment_completed\"");
        assert_eq!(SessionStatus::PaymentCompleted.as_str(), "payment_completed");
        assert_eq!(SessionMode::OnDemand.as_str(), "on_demand");
    }

    #[test]
    fn parse_rejects_unknown() {
        assert_eq!("provider".parse::<Role>().ok(), Some(Role::Provider));
        let err = "wizard".parse::<Role>().err();
        assert_eq!(err.map(|e| e.value), Some("wizard".to_owned()));
    }
}
