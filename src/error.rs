use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::api_server::UploadResponse;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Failure of a single call to the chat-completions endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse response: {source}, raw response: {body}")]
    Decode {
        source: serde_json::Error,
        body: String,
    },

    #[error("response contained no choices")]
    NoChoices,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no file in form field `file`")]
    MissingFile,

    #[error("failed to read multipart form: {0}")]
    Multipart(String),

    #[error("upload too large: request bodies are limited to {limit} bytes")]
    TooLarge { limit: usize },

    #[error("unsupported file type: {0:?}, allowed: jpg, jpeg, png, gif, webp")]
    UnsupportedExtension(String),

    #[error("failed to create upload directory: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to save file: {0}")]
    Write(std::io::Error),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::MissingFile
            | UploadError::Multipart(_)
            | UploadError::UnsupportedExtension(_) => StatusCode::BAD_REQUEST,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::CreateDir(_) | UploadError::Write(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("upload failed: {}", self);
        } else {
            warn!("upload rejected: {}", self);
        }

        (status, Json(UploadResponse::failure(self.to_string()))).into_response()
    }
}
