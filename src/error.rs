use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Swivel daemon
#[derive(Error, Debug)]
pub enum SwivelError {
    // Request validation
    #[error("Invalid request: {0}")]
    Validation(String),

    // A mutually exclusive operation is already in flight
    #[error("Conflict: {0}")]
    Conflict(String),

    // Proxy service is already running
    #[error("Service busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Probe outcomes
    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    // Listener bind failures and other job-terminating conditions
    #[error("Fatal: {0}")]
    Fatal(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O and persistence
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // Upstream HTTP failures (range fetches, speed tests)
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Swivel operations
pub type Result<T> = std::result::Result<T, SwivelError>;

impl SwivelError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SwivelError::Validation(_) | SwivelError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            SwivelError::NotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            SwivelError::Conflict(_) => StatusCode::CONFLICT,

            // 504 Gateway Timeout
            SwivelError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            SwivelError::Busy(_)
            | SwivelError::Probe(_)
            | SwivelError::Cancelled
            | SwivelError::Fatal(_)
            | SwivelError::Io(_)
            | SwivelError::Csv(_)
            | SwivelError::Http(_)
            | SwivelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this error is transient: logged and recovered locally,
    /// never terminating the owning job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwivelError::Probe(_) | SwivelError::Timeout | SwivelError::Http(_)
        )
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for SwivelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from reqwest errors, preserving the timeout distinction
impl From<reqwest::Error> for SwivelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SwivelError::Timeout
        } else {
            SwivelError::Http(err.to_string())
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for SwivelError {
    fn from(err: url::ParseError) -> Self {
        SwivelError::Validation(err.to_string())
    }
}
