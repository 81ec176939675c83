//! Who may do what to a reading session.
//!
//! One predicate covers every transition, so role rules live in a single
//! table instead of being spread across handlers.

use parlor_types::{Identity, ReadingSession};

use crate::error::HubError;

/// An operation on an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read the session.
    View,
    /// Move it to `in_progress`.
    Start,
    /// End and settle it.
    End,
    /// Cancel it.
    Cancel,
    /// Record the external payment confirmation.
    ConfirmPayment,
    /// Record an external payment failure.
    FailPayment,
}

impl Action {
    /// Lowercase name for messages and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Start => "start",
            Self::End => "end",
            Self::Cancel => "cancel",
            Self::ConfirmPayment => "confirm payment for",
            Self::FailPayment => "fail payment for",
        }
    }
}

/// Whether `caller` may perform `action` on `session`.
///
/// Admins may do everything. Either party may view, start, end or cancel.
/// Only the paying client may report payment outcomes.
pub fn is_allowed(caller: &Identity, session: &ReadingSession, action: Action) -> bool {
    if caller.is_admin() {
        return true;
    }
    match action {
        Action::View | Action::Start | Action::End | Action::Cancel => session.is_party(caller.id),
        Action::ConfirmPayment | Action::FailPayment => caller.id == session.client_id,
    }
}

/// [`is_allowed`] as a `Result`.
///
/// # Errors
///
/// Returns [`HubError::Forbidden`] naming the action when it is not allowed.
pub fn authorize(
    caller: &Identity,
    session: &ReadingSession,
    action: Action,
) -> Result<(), HubError> {
    if is_allowed(caller, session, action) {
        Ok(())
    } else {
        tracing::debug!(
            caller = %caller.id,
            session_id = %session.id,
            action = action.as_str(),
            "session action rejected"
        );
        Err(HubError::Forbidden(format!(
            "user {} may not {} session {}",
            caller.id,
            action.as_str(),
            session.id
        )))
    }
}
