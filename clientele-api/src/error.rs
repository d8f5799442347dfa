//! Error Types for the HTTP Layer
//!
//! [`ApiError`] carries an [`ErrorCode`] that decides the status code. Every
//! error renders as the failure envelope `{"success": false, "error": ...}`,
//! with the code alongside.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clientele_core::{ClienteleError, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or unknown bearer key
    Unauthorized,

    /// Body could not be parsed
    MalformedBody,

    /// Input rejected before any I/O
    InvalidInput,

    /// Identity store failure
    DatabaseError,

    /// Lookup cache failure
    CacheError,

    /// Broker or workflow failure
    DeliveryError,

    /// Store pool exhausted or closed
    ServiceUnavailable,

    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::MalformedBody | ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError
            | ErrorCode::CacheError
            | ErrorCode::DeliveryError
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// RESPONSE ENVELOPE
// ============================================================================

/// `{success, error?, data?}` envelope shared by every JSON route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn done() -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            data: None,
        }
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized, "Unauthorized")
    }

    pub fn malformed_body(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedBody, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiResponse::<()> {
            success: false,
            error: Some(self.message),
            code: Some(self.code),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<ClienteleError> for ApiError {
    fn from(err: ClienteleError) -> Self {
        let code = match &err {
            ClienteleError::Validation(_) => ErrorCode::InvalidInput,
            ClienteleError::Store(StoreError::Pool { .. }) => ErrorCode::ServiceUnavailable,
            ClienteleError::Store(_) => ErrorCode::DatabaseError,
            ClienteleError::Cache(_) => ErrorCode::CacheError,
            ClienteleError::Delivery(_) => ErrorCode::DeliveryError,
            ClienteleError::Config(_) => ErrorCode::InternalError,
        };
        if code.status_code().is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(code, err.root_cause())
    }
}

/// Result type alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
