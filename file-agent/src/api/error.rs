use crate::utils::errors::AgentError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

impl AgentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::InvalidPath(_)
            | AgentError::InvalidArgument(_)
            | AgentError::UnsupportedFormat(_)
            | AgentError::Serialization(_) => StatusCode::BAD_REQUEST,
            AgentError::NotEditable(_) => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::AlreadyExists(_) | AgentError::Incomplete { .. } => StatusCode::CONFLICT,
            AgentError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AgentError::ChecksumMismatch { .. } | AgentError::Extraction(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AgentError::Download { retryable: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            AgentError::Download { .. } | AgentError::Process(_) => StatusCode::BAD_GATEWAY,
            AgentError::PartiallyApplied { source, .. } => source.status_code(),
            AgentError::Config(_) | AgentError::Io(_) | AgentError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
            "retryable": self.retryable(),
        });
        if let Some(changes) = self.partial_changes() {
            body["changes"] = json!(changes);
        }
        (status, Json(body)).into_response()
    }
}
