//! Error types for agencycomm

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Protocol Errors ===
    #[error("Invalid redirect location: {0}")]
    InvalidRedirect(String),

    #[error("Redirect to unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Invalid endpoint specification: {0}")]
    InvalidEndpoint(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("watch".into()).is_retryable());
        assert!(Error::ConnectionFailed("tcp://a:1".into()).is_retryable());
        assert!(!Error::InvalidRedirect("ftp://x".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let e = Error::InvalidRedirect("gopher://x".into());
        assert_eq!(e.to_string(), "Invalid redirect location: gopher://x");
    }
}
