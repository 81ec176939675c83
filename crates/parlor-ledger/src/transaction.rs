//! Double-entry rows for a settlement.
//!
//! [`EntryBuilder`] validates a single leg; [`settlement_entries`] produces
//! the legs of one settlement: payer to provider and payer to platform.

use chrono::Utc;

use parlor_types::{LedgerAccount, LedgerEntryId, SessionId, SettlementEntry, UserId};

use crate::LedgerError;
use crate::split::SplitAmounts;

/// Who pays for a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payer {
    /// The client's internal balance.
    Client(UserId),
    /// A captured external payment.
    Gateway,
}

impl Payer {
    const fn account(self) -> (LedgerAccount, Option<UserId>) {
        match self {
            Self::Client(id) => (LedgerAccount::Client, Some(id)),
            Self::Gateway => (LedgerAccount::Gateway, None),
        }
    }
}

/// Builder for one validated [`SettlementEntry`].
///
/// # Examples
///
/// ```
/// use parlor_ledger::EntryBuilder;
/// use parlor_types::{LedgerAccount, SessionId, UserId};
///
/// let entry = EntryBuilder::new(SessionId::new())
///     .from(LedgerAccount::Client, Some(UserId::new()))
///     .to(LedgerAccount::Platform, None)
///     .amount(60)
///     .build();
///
/// assert!(entry.is_ok());
/// ```
#[derive(Debug)]
pub struct EntryBuilder {
    session_id: SessionId,
    from: Option<(LedgerAccount, Option<UserId>)>,
    to: Option<(LedgerAccount, Option<UserId>)>,
    amount: Option<i64>,
}

impl EntryBuilder {
    /// Start a leg for `session_id`.
    pub const fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            from: None,
            to: None,
            amount: None,
        }
    }

    /// Set the debited account.
    #[must_use]
    pub const fn from(mut self, account: LedgerAccount, user: Option<UserId>) -> Self {
        self.from = Some((account, user));
        self
    }

    /// Set the credited account.
    #[must_use]
    pub const fn to(mut self, account: LedgerAccount, user: Option<UserId>) -> Self {
        self.to = Some((account, user));
        self
    }

    /// Set the amount moved.
    #[must_use]
    pub const fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Validate and produce the entry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MissingField`] if a side or the amount is unset.
    /// - [`LedgerError::ZeroAmount`] / [`LedgerError::NegativeAmount`] for a non-positive amount.
    /// - [`LedgerError::AccountOwner`] if a user-owned account has no user or a
    ///   platform/gateway account names one.
    /// - [`LedgerError::SelfTransfer`] if both sides are the same account.
    pub fn build(self) -> Result<SettlementEntry, LedgerError> {
        let (from_account, from_user) = self.from.ok_or(LedgerError::MissingField("from"))?;
        let (to_account, to_user) = self.to.ok_or(LedgerError::MissingField("to"))?;
        let amount = self.amount.ok_or(LedgerError::MissingField("amount"))?;

        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if amount < 0 {
            return Err(LedgerError::NegativeAmount { amount });
        }
        check_owner(from_account, from_user)?;
        check_owner(to_account, to_user)?;
        if from_account == to_account && from_user == to_user {
            return Err(LedgerError::SelfTransfer(from_account));
        }

        Ok(SettlementEntry {
            id: LedgerEntryId::new(),
            session_id: self.session_id,
            from_account,
            from_user,
            to_account,
            to_user,
            amount,
            created_at: Utc::now(),
        })
    }
}

const fn check_owner(account: LedgerAccount, user: Option<UserId>) -> Result<(), LedgerError> {
    let needs_user = matches!(account, LedgerAccount::Client | LedgerAccount::Provider);
    if needs_user == user.is_some() {
        Ok(())
    } else {
        Err(LedgerError::AccountOwner(account))
    }
}

/// Build the ledger legs of one settlement.
///
/// Zero-amount legs are omitted, so a zero-minute reading produces no rows.
///
/// # Errors
///
/// Returns [`LedgerError`] if a leg fails validation or the amounts do not
/// reconcile.
pub fn settlement_entries(
    session_id: SessionId,
    payer: Payer,
    provider: UserId,
    amounts: &SplitAmounts,
) -> Result<Vec<SettlementEntry>, LedgerError> {
    if !amounts.reconciles() {
        return Err(LedgerError::Unreconciled(*amounts));
    }
    let (from_account, from_user) = payer.account();
    let mut entries = Vec::with_capacity(2);

    if amounts.provider > 0 {
        entries.push(
            EntryBuilder::new(session_id)
                .from(from_account, from_user)
                .to(LedgerAccount::Provider, Some(provider))
                .amount(amounts.provider)
                .build()?,
        );
    }
    if amounts.platform > 0 {
        entries.push(
            EntryBuilder::new(session_id)
                .from(from_account, from_user)
                .to(LedgerAccount::Platform, None)
                .amount(amounts.platform)
                .build()?,
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_settlement_has_two_legs_from_client() {
        let client = UserId::new();
        let provider = UserId::new();
        let amounts = SplitAmounts {
            total: 300,
            provider: 240,
            platform: 60,
        };
        let entries = settlement_entries(SessionId::new(), Payer::Client(client), provider, &amounts)
            .unwrap_or_default();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.from_account == LedgerAccount::Client && e.from_user == Some(client)));
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 300);
    }

    #[test]
    fn zero_cost_produces_no_rows() {
        let amounts = SplitAmounts {
            total: 0,
            provider: 0,
            platform: 0,
        };
        let entries =
            settlement_entries(SessionId::new(), Payer::Gateway, UserId::new(), &amounts);
        assert!(entries.is_ok_and(|e| e.is_empty()));
    }

    #[test]
    fn unreconciled_amounts_are_rejected() {
        let amounts = SplitAmounts {
            total: 300,
            provider: 240,
            platform: 59,
        };
        let result = settlement_entries(SessionId::new(), Payer::Gateway, UserId::new(), &amounts);
        assert!(matches!(result, Err(LedgerError::Unreconciled(_))));
    }

    #[test]
    fn builder_checks_account_owners() {
        let missing_user = EntryBuilder::new(SessionId::new())
            .from(LedgerAccount::Client, None)
            .to(LedgerAccount::Platform, None)
            .amount(1)
            .build();
        assert!(matches!(
            missing_user,
            Err(LedgerError::AccountOwner(LedgerAccount::Client))
        ));

        let zero = EntryBuilder::new(SessionId::new())
            .from(LedgerAccount::Gateway, None)
            .to(LedgerAccount::Platform, None)
            .amount(0)
            .build();
        assert!(matches!(zero, Err(LedgerError::ZeroAmount)));
    }
}
