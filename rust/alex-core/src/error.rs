//! The public error taxonomy.
//!
//! Every fallible public operation on the execution-and-event core returns
//! `Result<T, AppError>`. Internal glue that is not part of this taxonomy
//! (config loading, scheduler bookkeeping) keeps returning `anyhow::Result`,
//! matching the mixed `anyhow`/`thiserror` split used throughout this codebase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// One of the nine error kinds a run can terminate with, or a request can be
/// rejected with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("overloaded: {message}")]
    Overloaded { message: String, retry_after_ms: u64 },

    #[error("claim lost for run {run_id}")]
    ClaimLost { run_id: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("resume unrecoverable: {0}")]
    ResumeUnrecoverable(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// The error taxonomy's string tag, as recorded in `TaskResult::error_kind`
    /// and in terminal event payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Overloaded { .. } => "overloaded",
            Self::ClaimLost { .. } => "claim_lost",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::ToolFailed(_) => "tool_failed",
            Self::TransientIo(_) => "transient_io",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::ResumeUnrecoverable(_) => "resume_unrecoverable",
            Self::NotFound(_) => "not_found",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ClaimLost { .. } | Self::Cancelled => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ToolFailed(_) => StatusCode::BAD_GATEWAY,
            Self::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ResumeUnrecoverable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    retry_after_ms: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after_ms = match &self {
            Self::Overloaded { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        };
        let body = ErrorBody { error: self.to_string(), kind: self.kind(), retry_after_ms };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_carries_retry_hint() {
        let err = AppError::Overloaded { message: "pending queue full".into(), retry_after_ms: 250 };
        assert_eq!(err.kind(), "overloaded");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn claim_lost_maps_to_conflict() {
        let err = AppError::ClaimLost { run_id: "r1".into() };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
