//! Error types for the switching proxy
//!
//! [`SwitchError`] is the taxonomy surfaced by the switch controller and the forwarder.
//! [`ProxyError`] adds client-side request errors and renders everything as an
//! OpenAI-style JSON error body.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    /// The requested model id is not in the registry.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// The unit did not start, or did not pass its readiness probe, in time.
    #[error("backend unit '{unit}' did not become ready after {elapsed:?}")]
    BackendStartTimeout { unit: String, elapsed: Duration },

    /// Forwarding failed after the backend was believed ready.
    #[error("backend unit '{unit}' is unreachable: {reason}")]
    BackendUnreachable { unit: String, reason: String },
}

/// Errors returned by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Switch(#[from] SwitchError),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Switch(SwitchError::UnknownModel(_)) => StatusCode::NOT_FOUND,
            ProxyError::Switch(SwitchError::BackendStartTimeout { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Switch(SwitchError::BackendUnreachable { .. }) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::Switch(SwitchError::UnknownModel(_)) => "model_not_found",
            ProxyError::Switch(_) => "model_switcher_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = %status, error = %self, "Request failed");
        }
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (status, Json(body)).into_response()
    }
}
