use std::net::SocketAddr;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::extractor::ExtractorError;

/// Failures produced by the analyze/download/thumbnail pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed client input.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Upstream(#[from] ExtractorError),

    #[error("could not parse yt-dlp output: {0}")]
    Parse(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) | Self::Parse(_) | Self::Io { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Upstream(ExtractorError::NotFound { .. }) => "EXTRACTOR_NOT_FOUND",
            Self::Upstream(ExtractorError::TimedOut { .. }) => "EXTRACTOR_TIMEOUT",
            Self::Upstream(_) => "EXTRACTOR_FAILED",
            Self::Parse(_) => "PARSE_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io { .. } => "IO_FAILED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Text shown to the client. Extractor failures surface their stderr.
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream(error) => error.client_message(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorFormat {
    Json,
    PlainText,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

/// HTTP-facing error. JSON endpoints answer `{error, code}`; binary endpoints
/// answer with a plain-text body because the client navigates to them directly.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    format: ErrorFormat,
}

impl ApiError {
    pub fn json(error: AppError) -> Self {
        Self::from_app(error, ErrorFormat::Json)
    }

    pub fn text(error: AppError) -> Self {
        Self::from_app(error, ErrorFormat::PlainText)
    }

    fn from_app(error: AppError, format: ErrorFormat) -> Self {
        let status = error.status();
        if status.is_server_error() {
            warn!("Request failed: {error}");
        }

        Self {
            status,
            message: error.client_message(),
            code: Some(error.code()),
            format,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.format {
            ErrorFormat::Json => {
                let body = Json(ErrorBody {
                    error: self.message,
                    code: self.code,
                });
                (self.status, body).into_response()
            }
            ErrorFormat::PlainText => (
                self.status,
                [(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                self.message,
            )
                .into_response(),
        }
    }
}

/// Failures that abort process startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid origin in ALLOWED_ORIGINS: {0}. Use values like https://example.com")]
    InvalidOrigin(String),

    #[error("could not build the HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address {0}")]
    Address(String),

    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),
}
