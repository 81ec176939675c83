//! Error types for the session hub.
//!
//! [`HubError`] carries both domain rejections (authorization, state
//! conflicts, insufficient funds) and infrastructure faults (store, gateway,
//! timeouts). The HTTP layer maps each variant to a status code.

use parlor_db::DbError;
use parlor_ledger::LedgerError;
use parlor_types::{SessionStatus, UserId};

/// Errors raised by the external payment gateway client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("payment gateway request failed: {0}")]
    Request(String),

    /// The gateway answered with a non-success status.
    #[error("payment gateway returned {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },

    /// The gateway declined the operation.
    #[error("payment gateway declined {operation} of {payment_ref}")]
    Declined {
        /// `capture` or `refund`.
        operation: &'static str,
        /// The payment intent.
        payment_ref: String,
    },

    /// The call did not finish within its deadline.
    #[error("payment gateway timed out")]
    Timeout,

    /// The client could not be built from configuration.
    #[error("invalid payment gateway configuration: {0}")]
    Config(String),
}

/// Errors that can occur while operating the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The request is malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The caller could not be identified.
    #[error("caller is not authenticated")]
    Unauthenticated,

    /// The caller may not perform this action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Its id.
        id: uuid::Uuid,
    },

    /// The session is not in a state that allows the transition.
    #[error("session is {current}")]
    Conflict {
        /// Status at the time of the attempt.
        current: SessionStatus,
    },

    /// An on-demand session was requested from an offline provider.
    #[error("provider {0} is offline")]
    ProviderOffline(UserId),

    /// The client's balance does not cover the settlement.
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds {
        /// Balance at the time of the check.
        balance: i64,
        /// Frozen total cost.
        required: i64,
    },

    /// The payment gateway failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A bounded operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Settlement math failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Machine-readable reason sent in `settlement_failed` frames.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ProviderOffline(_) => "provider_offline",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Gateway(_) => "gateway_error",
            Self::Timeout(_) => "timeout",
            Self::Store(_) | Self::Ledger(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Missing amount for [`HubError::InsufficientFunds`].
    pub const fn shortfall(&self) -> Option<i64> {
        match self {
            Self::InsufficientFunds { balance, required } => required.checked_sub(*balance),
            _ => None,
        }
    }

    pub(crate) const fn session_not_found(id: parlor_types::SessionId) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.into_inner(),
        }
    }

    pub(crate) const fn user_not_found(id: UserId) -> Self {
        Self::NotFound {
            entity: "user",
            id: id.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_required_minus_balance() {
        let err = HubError::InsufficientFunds {
            balance: 250,
            required: 300,
        };
        assert_eq!(err.shortfall(), Some(50));
        assert_eq!(err.reason(), "insufficient_funds");
        assert_eq!(HubError::Timeout("settlement").shortfall(), None);
    }

    #[test]
    fn conflict_names_current_status() {
        let err = HubError::Conflict {
            current: SessionStatus::Completed,
        };
        assert_eq!(err.to_string(), "session is completed");
    }
}
