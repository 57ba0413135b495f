use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),
    #[error("sandbox provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::InvalidRequest(_) => "invalid_request",
            Self::EnvironmentUnavailable(_) => "environment_unavailable",
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing text. Host-level variants never carry their cause out.
    pub fn public_message(&self) -> String {
        match self {
            Self::UnsupportedLanguage(lang) => format!("Unsupported language: {lang}"),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::EnvironmentUnavailable(_) => {
                "Execution environment is not available".to_string()
            }
            Self::ProvisioningFailed(_) | Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedLanguage(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::EnvironmentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProvisioningFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.public_message(),
        });
        (self.status(), body).into_response()
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{value:#}"))
    }
}
