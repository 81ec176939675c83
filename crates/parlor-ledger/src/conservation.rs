//! Conservation check for a settlement's ledger legs.
//!
//! For every settlement the legs must satisfy:
//!
//! ```text
//! sum(debits from payer) == sum(credits) == total_cost
//! credits to provider   == provider share
//! credits to platform   == platform share
//! ```
//!
//! The legs are built to satisfy this, so the check passes by construction;
//! stores run it before committing anyway and refuse the write on a
//! violation.

use parlor_types::{LedgerAccount, SessionId, SettlementEntry};

use crate::LedgerAnomaly;
use crate::split::SplitAmounts;

/// Result of a conservation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConservationResult {
    /// Legs match the frozen amounts.
    Balanced,
    /// Legs and amounts disagree.
    Anomaly(LedgerAnomaly),
}

impl ConservationResult {
    /// Whether the check passed.
    pub const fn is_balanced(&self) -> bool {
        matches!(self, Self::Balanced)
    }
}

/// Verify the legs of one settlement against its frozen amounts.
pub fn verify_settlement(
    session_id: SessionId,
    entries: &[SettlementEntry],
    amounts: &SplitAmounts,
) -> ConservationResult {
    let mut debited: i64 = 0;
    let mut to_provider: i64 = 0;
    let mut to_platform: i64 = 0;

    for entry in entries {
        if entry.session_id != session_id {
            return anomaly(session_id, amounts, "entry belongs to another session");
        }
        let Some(sum) = debited.checked_add(entry.amount) else {
            return anomaly(session_id, amounts, "overflow while summing debits");
        };
        debited = sum;

        let target = match entry.to_account {
            LedgerAccount::Provider => &mut to_provider,
            LedgerAccount::Platform => &mut to_platform,
            LedgerAccount::Client | LedgerAccount::Gateway => {
                return anomaly(session_id, amounts, "credit to a paying account");
            }
        };
        let Some(sum) = target.checked_add(entry.amount) else {
            return anomaly(session_id, amounts, "overflow while summing credits");
        };
        *target = sum;
    }

    if debited == amounts.total && to_provider == amounts.provider && to_platform == amounts.platform
    {
        ConservationResult::Balanced
    } else {
        tracing::error!(
            %session_id,
            debited,
            to_provider,
            to_platform,
            total = amounts.total,
            "settlement legs do not match frozen amounts"
        );
        anomaly(session_id, amounts, "legs do not match frozen amounts")
    }
}

fn anomaly(session_id: SessionId, amounts: &SplitAmounts, detail: &str) -> ConservationResult {
    ConservationResult::Anomaly(LedgerAnomaly {
        session_id,
        amounts: *amounts,
        message: format!("LEDGER_ANOMALY for session {session_id}: {detail}"),
    })
}

#[cfg(test)]
mod tests {
    use parlor_types::UserId;

    use super::*;
    use crate::transaction::{Payer, settlement_entries};

    fn amounts() -> SplitAmounts {
        SplitAmounts {
            total: 300,
            provider: 240,
            platform: 60,
        }
    }

    #[test]
    fn built_legs_balance() {
        let session = SessionId::new();
        let entries = settlement_entries(session, Payer::Client(UserId::new()), UserId::new(), &amounts())
            .unwrap_or_default();
        assert_eq!(verify_settlement(session, &entries, &amounts()), ConservationResult::Balanced);
    }

    #[test]
    fn missing_leg_is_an_anomaly() {
        let session = SessionId::new();
        let mut entries = settlement_entries(session, Payer::Gateway, UserId::new(), &amounts())
            .unwrap_or_default();
        entries.pop();
        assert!(!verify_settlement(session, &entries, &amounts()).is_balanced());
    }

    #[test]
    fn foreign_session_is_an_anomaly() {
        let entries = settlement_entries(SessionId::new(), Payer::Gateway, UserId::new(), &amounts())
            .unwrap_or_default();
        let result = verify_settlement(SessionId::new(), &entries, &amounts());
        assert!(matches!(result, ConservationResult::Anomaly(a) if a.message.contains("another session")));
    }
}
