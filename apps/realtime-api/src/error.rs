use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::hub::supervisor::SupervisorError;

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Why a WebSocket upgrade was refused. Raised before the upgrade, so a
/// failed attempt never registers anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("missing link token")]
    MissingToken,
    #[error("invalid or expired link token")]
    InvalidToken,
    #[error("token does not belong to this user")]
    IdentityMismatch,
    #[error("unknown hub {0}")]
    UnknownHub(String),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl HandshakeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::IdentityMismatch => "IDENTITY_MISMATCH",
            Self::UnknownHub(_) => "UNKNOWN_HUB",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownHub(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::MissingToken | Self::InvalidToken | Self::IdentityMismatch => {
                StatusCode::UNAUTHORIZED
            }
        }
    }
}

impl From<HandshakeError> for ApiError {
    fn from(err: HandshakeError) -> Self {
        Self::new(err.status(), err.code(), err.to_string())
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        HandshakeError::from(err).into()
    }
}

impl From<SupervisorError> for HandshakeError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::UnknownHub(name) => Self::UnknownHub(name),
            SupervisorError::ShuttingDown => Self::ShuttingDown,
        }
    }
}
