use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the API client and reported by the telemetry store.
#[derive(Debug, Error)]
pub enum Error {
    /// The host could not be reached at all.
    #[error("could not connect to API at {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request exceeded its deadline and was aborted.
    #[error("request to {url} timed out after {duration:?}")]
    Timeout { url: String, duration: Duration },

    /// Non-2xx response other than 404.
    #[error("API {status}: {}", message.as_deref().unwrap_or("request failed"))]
    HttpStatus { status: u16, message: Option<String> },

    /// 404 from the server.
    #[error("not found: {resource}")]
    NotFound {
        resource: String,
        message: Option<String>,
    },

    /// Body was not JSON, or not the expected shape.
    #[error("could not decode response: {0}")]
    Decode(String),

    /// Rejected locally before any request was sent.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The configured backend variant has no endpoint for this operation.
    #[error("{operation} is not supported by the {variant} API")]
    Unsupported {
        operation: &'static str,
        variant: &'static str,
    },
}

impl Error {
    /// HTTP status carried by the error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::HttpStatus { status, .. } => Some(*status),
            Error::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Errors from the local snapshot cache. These are logged, never surfaced.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to create cache directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache lock poisoned")]
    Poisoned,

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}
