//! Error types for the Amnesia download service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type for cache and generation operations
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Generation failed; the original file is still available
    #[error("Download generation failed: {source}")]
    Generation {
        source: DownloadError,
        fallback_url: String,
    },

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while generating or caching a download
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Archive or box tree could not be parsed
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Container is valid but uses a layout we do not rewrite
    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    /// EPUB without a readable package document
    #[error("Package document missing or unreadable: {0}")]
    MissingPackageDocument(String),

    #[error("Source file not found: {0}")]
    SourceNotFound(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(err: tokio::task::JoinError) -> Self {
        DownloadError::TaskJoin(err.to_string())
    }
}

impl From<std::str::Utf8Error> for DownloadError {
    fn from(err: std::str::Utf8Error) -> Self {
        DownloadError::MalformedContainer(format!("invalid UTF-8: {}", err))
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut fallback_url = None;
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Generation {
                source,
                fallback_url: url,
            } => {
                tracing::error!(fallback_url = %url, "Generation error: {}", source);
                fallback_url = Some(url.clone());
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "generation_failed",
                    "Could not prepare this file with updated metadata; the original file can be downloaded instead".to_string(),
                )
            }
            AppError::Download(e) => {
                tracing::error!("Download error: {}", e);
                match e {
                    DownloadError::SourceNotFound(path) => (
                        StatusCode::NOT_FOUND,
                        "not_found",
                        format!("Source file not found: {}", path),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "download_error",
                        "Download error".to_string(),
                    ),
                }
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "IO error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            fallback_url,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
