//! HTTP client error types

use std::{error::Error as StdError, io, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, HttpError>;

/// Shared, opaque error source
pub type SharedSource = Arc<dyn StdError + Send + Sync>;

/// HTTP client errors
///
/// Cloneable so that one terminal result can be handed to every observer
/// attached to a request.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Header name or value that cannot be sent
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Invalid proxy configuration
    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    /// Configuration document could not be loaded
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// Client build error
    #[error("Failed to build HTTP client: {0}")]
    BuildError(String),

    /// Network request failed
    #[error("Network request failed: {0}")]
    Transport(SharedSource),

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Response rejected by a status validator
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: StatusCode, message: String },

    /// Response body did not match the requested shape
    #[error("Response could not be decoded: {source}")]
    Decoding { data: Bytes, source: SharedSource },

    /// Resume token unreadable or the transfer cannot be continued
    #[error("Download cannot be resumed: {0}")]
    ResumeUnsupported(String),

    /// Request body could not be built
    #[error("Request body could not be encoded: {0}")]
    Encoding(String),

    /// Request cancelled before it completed
    #[error("Request was cancelled")]
    Cancelled,

    /// Local file operation failed
    #[error("File operation failed for {}: {source}", .path.display())]
    Io { path: PathBuf, source: Arc<io::Error> },
}

impl HttpError {
    /// Wrap any transport failure
    pub fn transport(err: impl StdError + Send + Sync + 'static) -> Self {
        HttpError::Transport(Arc::new(err))
    }

    /// Body decoding failure carrying the raw bytes
    pub fn decoding(data: Bytes, err: impl StdError + Send + Sync + 'static) -> Self {
        HttpError::Decoding {
            data,
            source: Arc::new(err),
        }
    }

    /// File failure at `path`
    pub fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        HttpError::Io {
            path: path.into(),
            source: Arc::new(err),
        }
    }

    /// Map a reqwest failure, reporting timeouts with the budget that expired
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            HttpError::Timeout(timeout)
        } else {
            err.into()
        }
    }

    /// Whether the request ended because it was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HttpError::Cancelled)
    }

    /// Whether a resume attempt was refused
    pub fn is_resume_unsupported(&self) -> bool {
        matches!(self, HttpError::ResumeUnsupported(_))
    }

    /// Status code carried by the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            HttpError::BuildError(err.to_string())
        } else {
            HttpError::Transport(Arc::new(err))
        }
    }
}
