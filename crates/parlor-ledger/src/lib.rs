//! Settlement math and double-entry bookkeeping for reading sessions.
//!
//! Every settled reading moves money from exactly one payer (the client's
//! balance or a captured gateway payment) to the provider and the platform.
//! This crate computes those amounts and the ledger legs that record them.
//! It performs no I/O; the store applies the result atomically.
//!
//! # Modules
//!
//! - [`pricing`] -- billable minutes and total cost
//! - [`split`] -- the provider/platform [`RevenueSplit`]
//! - [`transaction`] -- validated ledger legs via [`EntryBuilder`]
//! - [`conservation`] -- check that legs match the frozen amounts
//!
//! # Usage
//!
//! ```
//! use parlor_ledger::{Payer, RevenueSplit, settlement_entries, total_cost};
//! use parlor_ledger::conservation::{ConservationResult, verify_settlement};
//! use parlor_types::{SessionId, UserId};
//!
//! let cost = total_cost(125, 100).ok();
//! assert_eq!(cost, Some(300));
//!
//! let amounts = RevenueSplit::default().split(300).ok();
//! let amounts = amounts.unwrap_or_default();
//! assert_eq!((amounts.provider, amounts.platform), (240, 60));
//!
//! let session = SessionId::new();
//! let entries = settlement_entries(session, Payer::Client(UserId::new()), UserId::new(), &amounts)
//!     .unwrap_or_default();
//! assert_eq!(verify_settlement(session, &entries, &amounts), ConservationResult::Balanced);
//! ```

pub mod conservation;
pub mod pricing;
pub mod split;
pub mod transaction;

// Re-export primary types at crate root.
pub use conservation::ConservationResult;
pub use pricing::{billable_minutes, total_cost};
pub use split::{RevenueSplit, SplitAmounts};
pub use transaction::{EntryBuilder, Payer, settlement_entries};

use parlor_types::{LedgerAccount, SessionId};
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while computing a settlement.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// An amount must be strictly positive.
    #[error("ledger amount must be non-zero")]
    ZeroAmount,

    /// An amount or price was negative.
    #[error("amount must not be negative, got {amount}")]
    NegativeAmount {
        /// The invalid amount.
        amount: i64,
    },

    /// Checked arithmetic overflowed.
    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),

    /// The configured provider share is outside `[0, 1]`.
    #[error("provider share must be between 0 and 1, got {provider_share}")]
    InvalidShare {
        /// The rejected share.
        provider_share: Decimal,
    },

    /// A required builder field was not set.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A user-owned account lacks a user, or a shared account names one.
    #[error("invalid owner for {0} account")]
    AccountOwner(LedgerAccount),

    /// Both sides of a leg are the same account.
    #[error("entry debits and credits the same {0} account")]
    SelfTransfer(LedgerAccount),

    /// Provider and platform shares do not add up to the total.
    #[error("split does not reconcile: {0:?}")]
    Unreconciled(SplitAmounts),
}

// ---------------------------------------------------------------------------
// Anomaly type
// ---------------------------------------------------------------------------

/// A settlement whose ledger legs disagree with its frozen amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAnomaly {
    /// The settled session.
    pub session_id: SessionId,
    /// The amounts the legs were checked against.
    pub amounts: SplitAmounts,
    /// Human-readable description.
    pub message: String,
}

impl core::fmt::Display for LedgerAnomaly {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.message)
    }
}
