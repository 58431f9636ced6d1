//! Error types for the Syllendar API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::documents::DocumentError;
use crate::ics::IcsError;
use crate::llm::LlmError;

/// Characters of raw model output kept in diagnostics.
pub const SAMPLE_LEN: usize = 200;

/// Top-level error returned by handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("AI returned invalid JSON format. Response: {sample}...")]
    MalformedModelOutput { sample: String },

    #[error("Error generating ICS file: {0}")]
    Ics(#[from] IcsError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Invalid upload: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),
}

impl AppError {
    pub fn malformed_output(raw: &str) -> Self {
        AppError::MalformedModelOutput {
            sample: raw.chars().take(SAMPLE_LEN).collect(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Multipart(_) => StatusCode::BAD_REQUEST,
            AppError::Document(_) => StatusCode::BAD_REQUEST,
            AppError::Ics(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Llm(_) => StatusCode::BAD_GATEWAY,
            AppError::MalformedModelOutput { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Configuration-related errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
