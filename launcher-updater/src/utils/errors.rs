//! Error taxonomy for the update engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        /// The target host is loopback, so the failure means "offline mode"
        offline: bool,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Size limit exceeded for {what}: {size} bytes (limit {limit})")]
    SizeLimitExceeded { what: String, size: u64, limit: u64 },

    #[error("Path traversal attempt: {0}")]
    PathTraversalAttempt(String),

    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Delta apply failure: {0}")]
    DeltaApplyFailure(String),

    #[error("Backup failure: {0}")]
    BackupFailure(String),

    #[error("Rollback failure: {0}")]
    RollbackFailure(String),

    #[error("No source available")]
    NoSourceAvailable,

    #[error("A transfer to {0} is already active")]
    AlreadyActive(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Version error: {0}")]
    Version(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl UpdateError {
    /// Build a network error, classifying loopback targets as offline.
    pub fn network(url: &str, message: impl Into<String>) -> Self {
        UpdateError::Network {
            url: url.to_string(),
            message: message.into(),
            offline: is_loopback_url(url),
        }
    }

    /// Convert a reqwest failure, keeping connection/timeouts in the
    /// network class so the orchestrator can spot offline mode.
    pub fn from_request(url: &str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            UpdateError::network(url, err.to_string())
        } else if let Some(status) = err.status() {
            UpdateError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }
        } else {
            UpdateError::Http(err)
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, UpdateError::Network { offline: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }
}

/// True when the URL points at localhost or a loopback address.
pub fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    match parsed.host_str() {
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            host.eq_ignore_ascii_case("localhost")
                || host
                    .parse::<std::net::IpAddr>()
                    .map(|ip| ip.is_loopback())
                    .unwrap_or(false)
        }
        None => false,
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback_url("http://localhost:8080/version.txt"));
        assert!(is_loopback_url("https://127.0.0.1/files"));
        assert!(is_loopback_url("http://[::1]:9000/"));
        assert!(!is_loopback_url("https://cdn.example.com/version.txt"));
        assert!(!is_loopback_url("not a url"));
    }

    #[test]
    fn test_network_error_offline_flag() {
        let err = UpdateError::network("http://127.0.0.1:1/version.txt", "connection refused");
        assert!(err.is_offline());

        let err = UpdateError::network("https://cdn.example.com/version.txt", "timed out");
        assert!(!err.is_offline());
        assert!(err.to_string().contains("cdn.example.com"));
    }
}
