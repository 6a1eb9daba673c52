//! Error types for the hub service.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scp::{ErrorBody, ScpErrorCode};
use scp_evm::SigningError;

use crate::store::StoreError;
use crate::webhooks::WebhookError;

/// Errors returned by hub handlers.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A request failed protocol validation.
    #[error("{code}: {message}")]
    Rejected {
        /// HTTP status.
        status: StatusCode,
        /// Protocol error code.
        code: ScpErrorCode,
        /// Detail for the caller.
        message: String,
    },

    /// The request body was not valid JSON for the endpoint.
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    /// Persisting hub state failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Signing a ticket or state failed.
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),
}

impl HubError {
    /// A rejection with an explicit status.
    #[must_use]
    pub fn rejected(status: StatusCode, code: ScpErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 with [`ScpErrorCode::PolicyViolation`].
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::rejected(StatusCode::BAD_REQUEST, ScpErrorCode::PolicyViolation, message)
    }

    /// 409 with the given code.
    #[must_use]
    pub fn conflict(code: ScpErrorCode, message: impl Into<String>) -> Self {
        Self::rejected(StatusCode::CONFLICT, code, message)
    }

    /// 404 with the given code.
    #[must_use]
    pub fn not_found(code: ScpErrorCode, message: impl Into<String>) -> Self {
        Self::rejected(StatusCode::NOT_FOUND, code, message)
    }

    /// HTTP status this error maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Rejected { status, .. } => *status,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire body for this error. Internal failures are retryable.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Rejected { code, message, .. } => ErrorBody::new(*code, message.clone()),
            Self::InvalidBody(rejection) => {
                ErrorBody::new(ScpErrorCode::PolicyViolation, rejection.body_text())
            }
            Self::Store(_) | Self::Signing(_) => {
                ErrorBody::new(ScpErrorCode::PolicyViolation, self.to_string()).retryable()
            }
        }
    }
}

impl From<WebhookError> for HubError {
    fn from(err: WebhookError) -> Self {
        let status = match err {
            WebhookError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::rejected(status, ScpErrorCode::PolicyViolation, err.to_string())
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "hub request failed");
        } else {
            tracing::debug!(%status, error = %self, "hub request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
