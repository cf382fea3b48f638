//! Error taxonomy for the gateway
//!
//! Every failure is caught at the request boundary and rendered as an
//! OpenAI-style JSON error body with a matching status code.
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("{0}")]
    MalformedRequest(String),

    #[error("No available text models found on Horde")]
    NoAvailableModels,

    #[error("{0}")]
    ConfigurationError(String),

    #[error("Failed to submit generation to Horde")]
    SubmissionFailed { details: String },

    #[error("{context}")]
    UpstreamRequestFailed {
        context: &'static str,
        details: String,
    },

    #[error("Generation timed out")]
    GenerationTimedOut { job_id: String },

    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl GatewayError {
    /// Shorthand for a failed call to the horde API.
    pub fn upstream(details: impl ToString) -> Self {
        GatewayError::UpstreamRequestFailed {
            context: "Horde API request failed",
            details: details.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            GatewayError::MalformedRequest(_) | GatewayError::ConfigurationError(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NoAvailableModels => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SubmissionFailed { .. } | GatewayError::UpstreamRequestFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::GenerationTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// The `type` field of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthenticationRequired => "authentication_required",
            GatewayError::MalformedRequest(_) => "invalid_request_error",
            GatewayError::NoAvailableModels => "no_available_models",
            GatewayError::ConfigurationError(_) => "configuration_error",
            GatewayError::SubmissionFailed { .. } => "submission_failed",
            GatewayError::UpstreamRequestFailed { .. } => "upstream_request_failed",
            GatewayError::GenerationTimedOut { .. } => "generation_timed_out",
            GatewayError::MethodNotAllowed => "method_not_allowed",
        }
    }

    fn details(&self) -> Option<&str> {
        match self {
            GatewayError::SubmissionFailed { details }
            | GatewayError::UpstreamRequestFailed { details, .. } => Some(details),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), details = ?self.details(), "{}", self);
        } else {
            warn!(kind = self.kind(), "{}", self);
        }

        let mut error = json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            error["details"] = json!(details);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
