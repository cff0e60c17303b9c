use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::common::error::DomainError;
use serde::Serialize;

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
pub(crate) struct ErrorDetail {
    /// Machine-readable error code (e.g. `SERVICE_NOT_FOUND`).
    code: &'static str,
    message: String,
}

/// Standard API error type.
///
/// All variants produce `{"error":{"code":"SCREAMING_SNAKE","message":"..."}}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound { code: &'static str, message: String },
    BadRequest { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    Forbidden { message: String },
    Internal { message: String },
    ServiceUnavailable { message: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            Self::Forbidden { message } => (StatusCode::FORBIDDEN, "PERMISSION_DENIED", message),
            Self::Internal { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
            Self::ServiceUnavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                message,
            ),
        };

        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        let message = err.to_string();
        match err {
            DomainError::NotFound(_) => Self::NotFound {
                code: "NOT_FOUND",
                message,
            },
            DomainError::InvalidArgument(_) => Self::BadRequest {
                code: "VALIDATION_ERROR",
                message,
            },
            DomainError::AlreadyExists(_) => Self::Conflict {
                code: "ALREADY_EXISTS",
                message,
            },
            DomainError::PermissionDenied(_) => Self::Forbidden { message },
            DomainError::Interrupted(_) => Self::ServiceUnavailable { message },
            DomainError::OutOfMemory(_) => Self::Internal { message },
        }
    }
}
