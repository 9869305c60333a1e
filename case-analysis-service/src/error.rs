//! Unified API error handling
//!
//! Every endpoint returns `Result<T, ApiError>`; failures render as
//! `{error, message, requestId}` JSON.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use case_flow::{CapabilityError, PipelineError};
use serde::Serialize;
use uuid::Uuid;

/// Standard error response format
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad request / validation error (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Upstream capability failure (502)
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "validation_error",
            ApiError::ExternalService(_) => "capability_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();
        let request_id = Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(error_type, status = status.as_u16(), %request_id, message = %self, "API error");
        } else {
            tracing::warn!(error_type, status = status.as_u16(), %request_id, message = %self, "API error");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(message) => ApiError::BadRequest(message),
            PipelineError::Capability(e) => ApiError::ExternalService(e.to_string()),
            err @ (PipelineError::ExtractionFailed { .. }
            | PipelineError::SynthesisFailed { .. }
            | PipelineError::AnalysisFailed { .. }) => ApiError::ExternalService(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CapabilityError> for ApiError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::NotConfigured(_) => ApiError::Internal(err.to_string()),
            other => ApiError::ExternalService(other.to_string()),
        }
    }
}
