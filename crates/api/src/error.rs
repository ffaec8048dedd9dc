//! API error types with HTTP response mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::ErrorClass;
use issuance::IssuanceError;
use saga::SagaError;
use serde::Serialize;

/// API-level error type that maps to HTTP responses.
///
/// The body always carries the stable error code next to a readable message.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request the core never saw.
    BadRequest { code: &'static str, message: String },
    Issuance(IssuanceError),
    Saga(SagaError),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { code, .. } => code,
            ApiError::Issuance(e) => e.code(),
            ApiError::Saga(e) => e.code(),
        }
    }

    fn class(&self) -> Option<ErrorClass> {
        match self {
            ApiError::BadRequest { .. } => None,
            ApiError::Issuance(e) => Some(e.class()),
            ApiError::Saga(e) => Some(e.class()),
        }
    }
}

/// HTTP status for each error class.
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Conflict => StatusCode::TOO_MANY_REQUESTS,
        ErrorClass::InvariantViolated => StatusCode::CONFLICT,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Forbidden => StatusCode::FORBIDDEN,
        ErrorClass::ExternalTransient => StatusCode::BAD_GATEWAY,
        ErrorClass::ExternalTerminal => StatusCode::PAYMENT_REQUIRED,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.class();
        let status = class.map_or(StatusCode::BAD_REQUEST, status_for);
        let code = self.code();

        let (message, details) = match self {
            ApiError::BadRequest { message, .. } => (message, None),
            ApiError::Issuance(e) => (e.to_string(), None),
            ApiError::Saga(SagaError::InsufficientStock(shortfalls)) => {
                let message = format!("Insufficient stock for {} option(s)", shortfalls.len());
                (message, serde_json::to_value(&shortfalls).ok())
            }
            ApiError::Saga(e) => (e.to_string(), None),
        };

        if status.is_server_error() {
            tracing::error!(%code, error = %message, "request failed");
        }

        let body = ErrorBody {
            code,
            message,
            details,
        };
        let mut response = (status, axum::Json(body)).into_response();
        if class.is_some_and(|c| c.is_retryable()) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<IssuanceError> for ApiError {
    fn from(err: IssuanceError) -> Self {
        ApiError::Issuance(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}
