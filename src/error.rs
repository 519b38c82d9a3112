use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ProvisionerError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Probe returned unexpected shape: {0}")]
    ProbeAmbiguous(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Whether retrying the same call has a chance of succeeding.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for ProvisionerError {
    fn is_retryable(&self) -> bool {
        match self {
            ProvisionerError::Timeout { .. } | ProvisionerError::Conflict(_) => true,
            ProvisionerError::DatabaseError(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

/// Connection-level failures; statement errors reported by the server are not transient.
fn is_transient_sqlx(e: &SqlxError) -> bool {
    matches!(
        e,
        SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::Protocol(_)
            | SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed
    )
}

impl From<figment::Error> for ProvisionerError {
    fn from(e: figment::Error) -> Self {
        ProvisionerError::ConfigError(Box::new(e))
    }
}

impl IntoResponse for ProvisionerError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            ProvisionerError::InvalidIdentity(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorBody {
                    code: "INVALID_IDENTITY".to_string(),
                    message: msg,
                },
            ),
            ProvisionerError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiErrorBody {
                    code: "NOT_FOUND".to_string(),
                    message: format!("{what} not found."),
                },
            ),
            ProvisionerError::AlreadyExists(what) => (
                StatusCode::CONFLICT,
                ApiErrorBody {
                    code: "CONFLICT".to_string(),
                    message: format!("{what} already exists."),
                },
            ),
            ProvisionerError::Conflict(what) => (
                StatusCode::CONFLICT,
                ApiErrorBody {
                    code: "CONFLICT".to_string(),
                    message: what,
                },
            ),
            ProvisionerError::JsonError(_) => (
                StatusCode::BAD_REQUEST,
                ApiErrorBody {
                    code: "BAD_REQUEST".to_string(),
                    message: "Malformed request body.".to_string(),
                },
            ),
            ProvisionerError::Timeout { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorBody {
                    code: "TIMEOUT".to_string(),
                    message: "Backing store did not answer in time.".to_string(),
                },
            ),
            ProvisionerError::DatabaseError(_)
            | ProvisionerError::ConfigError(_)
            | ProvisionerError::ProbeAmbiguous(_)
            | ProvisionerError::RactorError(_)
            | ProvisionerError::TaskFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorBody {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                },
            ),
        };
        (status, Json(ApiErrorResponse { error: error_body })).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}
