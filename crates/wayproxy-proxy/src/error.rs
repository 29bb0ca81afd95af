//! Error types for the proxy.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use thiserror::Error;

use wayproxy_core::ConfigError;
use wayproxy_storage::StorageError;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// Invalid proxy options.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// No capture (or no collection) for the request.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Live fetch failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The archive store cannot serve the request.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The client request cannot be handled.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Recorder error.
    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl ProxyError {
    /// HTTP status reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Recorder(RecorderError::Aborted(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response describing this error.
    pub fn to_response(&self) -> Response<Bytes> {
        let body = Bytes::from(format!("{}\n", self));
        let len = body.len();
        let mut response = Response::new(body);
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(len));
        response
    }
}

impl From<StorageError> for ProxyError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::StoreUnavailable(err.to_string())
        }
    }
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to issue a host certificate.
    #[error("Failed to issue certificate for {host}: {reason}")]
    Issue {
        /// Host the certificate was for.
        host: String,
        /// What went wrong.
        reason: String,
    },
}

/// Session recorder error type.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The recorder was closed.
    #[error("Recorder is closed")]
    Closed,

    /// The response stream failed before completing; nothing was recorded.
    #[error("Capture aborted: {0}")]
    Aborted(String),

    /// Captures were accepted but the archive failed to store them.
    #[error("{0} captures could not be written")]
    WriteFailed(usize),

    /// The archive store rejected a write.
    #[error("Store error: {0}")]
    Store(#[from] StorageError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
