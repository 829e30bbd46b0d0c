//! HTTP artifact transfer: resumable single-stream downloads, parallel
//! range downloads and the adaptive bandwidth model that drives them.

pub mod bandwidth;
pub mod chunked;
pub mod control;
pub mod manager;
pub mod progress;
pub mod progress_stream;
pub mod resumable;
pub mod state;

use std::time::Duration;

use crate::config::TransferConfig;
use crate::utils::errors::is_loopback_url;
use crate::{Result, UpdateError};

pub use bandwidth::{AdaptiveBandwidthController, BandwidthMonitor, ConnectionProfile};
pub use chunked::ChunkedDownloader;
pub use control::{ControlState, TransferControl};
pub use manager::DownloadManager;
pub use progress::{format_bytes, format_duration, format_speed, ProgressTracker, TransferProgress};
pub use resumable::{RemoteInfo, ResumableTransfer, TransferOptions};
pub use state::TransferState;

/// Upgrade `http://` to `https://` unless loopback plain HTTP is allowed.
///
/// Runs before any network I/O for every URL the engine fetches.
pub fn secure_url(url: &str, allow_insecure_loopback: bool) -> Result<String> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| UpdateError::InvalidUrl(format!("{}: {}", url, e)))?;
    if parsed.host_str().is_none() {
        return Err(UpdateError::InvalidUrl(format!("{}: missing host", url)));
    }

    match parsed.scheme() {
        "https" => Ok(url.to_string()),
        "http" if allow_insecure_loopback && is_loopback_url(url) => Ok(url.to_string()),
        "http" => Ok(format!("https{}", &url["http".len()..])),
        other => Err(UpdateError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            url, other
        ))),
    }
}

/// Shared HTTP client for every transfer the engine performs.
pub fn build_client(config: &TransferConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(concat!("launcher-updater/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Join a base URL and a file name with exactly one slash.
pub fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_url_upgrades_http() -> Result<()> {
        assert_eq!(
            secure_url("http://cdn.example.com/version.txt", false)?,
            "https://cdn.example.com/version.txt"
        );
        assert_eq!(
            secure_url("https://cdn.example.com/version.txt", false)?,
            "https://cdn.example.com/version.txt"
        );
        Ok(())
    }

    #[test]
    fn test_secure_url_loopback() -> Result<()> {
        assert_eq!(
            secure_url("http://127.0.0.1:8080/a.zip", true)?,
            "http://127.0.0.1:8080/a.zip"
        );
        // Loopback is only exempt when explicitly allowed
        assert_eq!(
            secure_url("http://127.0.0.1:8080/a.zip", false)?,
            "https://127.0.0.1:8080/a.zip"
        );
        // Non-loopback hosts are upgraded even when the flag is set
        assert_eq!(
            secure_url("http://example.com/a.zip", true)?,
            "https://example.com/a.zip"
        );
        Ok(())
    }

    #[test]
    fn test_secure_url_rejects_garbage() {
        assert!(matches!(
            secure_url("not a url", false),
            Err(UpdateError::InvalidUrl(_))
        ));
        assert!(matches!(
            secure_url("ftp://example.com/file", false),
            Err(UpdateError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://cdn.example.com/", "/version.txt"),
            "https://cdn.example.com/version.txt"
        );
        assert_eq!(join_url("https://cdn.example.com", "a.zip"), "https://cdn.example.com/a.zip");
    }
}
