//! Error types for the HTTP surface.
//!
//! [`ApiError`] unifies request-parsing failures and hub failures into a
//! single enum that converts into an Axum response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parlor_db::DbError;
use parlor_hub::HubError;
use tracing::error;

/// Errors that can occur in the HTTP API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The hub rejected or failed the operation.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// An id in the path or a header could not be parsed.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Hub(err) => match err {
                HubError::Validation(_) => StatusCode::BAD_REQUEST,
                HubError::Unauthenticated => StatusCode::UNAUTHORIZED,
                HubError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                HubError::Forbidden(_) => StatusCode::FORBIDDEN,
                HubError::NotFound { .. } | HubError::Store(DbError::NotFound { .. }) => {
                    StatusCode::NOT_FOUND
                }
                HubError::Conflict { .. }
                | HubError::ProviderOffline(_)
                | HubError::Store(DbError::Duplicate { .. }) => StatusCode::CONFLICT,
                HubError::Gateway(_) => StatusCode::BAD_GATEWAY,
                HubError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                HubError::Store(_) | HubError::Ledger(_) | HubError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Machine-readable reason.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidId(_) => "invalid_request",
            Self::Hub(err) => err.reason(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "reason": self.reason(),
            "status": status.as_u16(),
        });
        if let (Self::Hub(err), Some(fields)) = (&self, body.as_object_mut()) {
            match err {
                HubError::Conflict { current } => {
                    fields.insert("current".to_owned(), serde_json::json!(current));
                }
                HubError::InsufficientFunds { .. } => {
                    fields.insert("shortfall".to_owned(), serde_json::json!(err.shortfall()));
                }
                _ => {}
            }
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use parlor_types::SessionStatus;

    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (HubError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (HubError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (
                HubError::InsufficientFunds {
                    balance: 1,
                    required: 2,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (HubError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (
                HubError::Conflict {
                    current: SessionStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (HubError::Timeout("store"), StatusCode::GATEWAY_TIMEOUT),
            (HubError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::InvalidId("nope".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
