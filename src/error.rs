//! Error types for the proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Authorization header with upstream API key is required.")]
    MissingCredential,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Streaming responses are disabled on this proxy.")]
    StreamingDisabled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    /// Transport failure talking to upstream before any response body was read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    /// Status returned to the caller when this error ends a request before any
    /// response bytes were written.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest { .. } | Self::StreamingDisabled => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the `{"error": ...}` body.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream { message } | Self::Translation { message } => message.clone(),
            Self::Http(_) => "Failed to proxy request to upstream.".to_string(),
            Self::Config { .. } | Self::Toml(_) => "Internal proxy error.".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error body returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::new(self.public_message()))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
