use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::repository::StoreError;
use crate::validation::{Violation, Violations};

/// ErrorKind
///
/// The closed set of failure outcomes a request can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    Forbidden,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
            // Refusals look exactly like missing rows from the outside.
            ErrorKind::Forbidden | ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The code shown to clients.
    pub fn public_code(self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Forbidden | ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }

    fn public_message(self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "The request failed validation.",
            ErrorKind::Forbidden | ErrorKind::NotFound => "The requested resource was not found.",
            ErrorKind::Conflict => "The request conflicts with existing data.",
            ErrorKind::Unavailable => "The service is temporarily unavailable. Try again shortly.",
            ErrorKind::Internal => "An unexpected error occurred.",
        }
    }

    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Unavailable
    }
}

/// Failure
///
/// The error half of every service result. Carries an internal `detail` for logs
/// that is never sent to the client.
#[derive(Debug, Error)]
#[error("{kind:?}: {detail}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub detail: String,
    pub violations: Violations,
}

pub type ServiceResult<T> = Result<T, Failure>;

impl Failure {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            violations: Violations::default(),
        }
    }

    pub fn validation(violations: Violations) -> Self {
        Self {
            kind: ErrorKind::ValidationFailed,
            detail: violations.to_string(),
            violations,
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }
}

impl From<Violations> for Failure {
    fn from(violations: Violations) -> Self {
        Failure::validation(violations)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Denied(detail) => Failure::forbidden(detail),
            StoreError::Conflict(detail) => Failure::conflict(detail),
            StoreError::Unavailable(detail) => Failure::unavailable(detail),
            StoreError::Backend(detail) => Failure::internal(detail),
        }
    }
}

/// ErrorBody
///
/// JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        match self.kind {
            ErrorKind::ValidationFailed => {
                tracing::info!(detail = %self.detail, "request rejected by validation")
            }
            ErrorKind::Forbidden => tracing::warn!(kind = ?self.kind, detail = %self.detail, "request refused by policy"),
            ErrorKind::NotFound => tracing::warn!(kind = ?self.kind, detail = %self.detail, "requested row not found"),
            ErrorKind::Conflict => tracing::warn!(detail = %self.detail, "request conflicted with stored data"),
            ErrorKind::Unavailable => tracing::error!(detail = %self.detail, "storage unavailable"),
            ErrorKind::Internal => tracing::error!(detail = %self.detail, "internal failure"),
        }

        let body = ErrorBody {
            code: self.kind.public_code().to_string(),
            message: self.kind.public_message().to_string(),
            retryable: self.kind.is_retryable(),
            violations: self.violations.into_vec(),
        };

        let mut response = (self.kind.status(), Json(body)).into_response();
        if self.kind == ErrorKind::Unavailable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
