//! Single-stream HTTP download that survives interruption.
//!
//! Bytes land in `<dest>.tmp` while a `<dest>.state` sidecar records how far
//! the transfer got. A later `fetch` of the same URL picks up from the
//! persisted offset with a `Range` request, provided the remote validators
//! (`ETag`, `Last-Modified`) still match.

use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, LAST_MODIFIED,
    RANGE,
};
use reqwest::{Response, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::control::TransferControl;
use super::progress::{ProgressTracker, TransferProgress};
use super::progress_stream::{ProgressCallback, ProgressStream};
use super::secure_url;
use super::state::TransferState;
use crate::config::TransferConfig;
use crate::fs::atomic::replace_file;
use crate::{Result, UpdateError};

/// Persist state every 100 reads worth of bytes
pub const STATE_FLUSH_BYTES: u64 = 8192 * 100;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// A body may run past its declared length by `1 / SIZE_SLACK_DIVISOR`.
pub const SIZE_SLACK_DIVISOR: u64 = 10;

/// Receives progress snapshots at most every 250 ms
pub type ProgressSink = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub max_file_size: u64,
    pub allow_insecure_loopback: bool,
    pub flush_interval: u64,
}

impl TransferOptions {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            allow_insecure_loopback: config.allow_insecure_loopback,
            flush_interval: STATE_FLUSH_BYTES,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allow_insecure_loopback: false,
            flush_interval: STATE_FLUSH_BYTES,
        }
    }
}

/// What the capability probe learned about a resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteInfo {
    pub total_size: Option<u64>,
    pub supports_resume: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl RemoteInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            total_size: text(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            supports_resume: text(ACCEPT_RANGES)
                .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            etag: text(ETAG),
            last_modified: text(LAST_MODIFIED),
        }
    }
}

/// Parse `bytes <start>-<end>/<total>` into `(start, total)`.
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

pub struct ResumableTransfer {
    client: reqwest::Client,
    options: TransferOptions,
    control: TransferControl,
    progress: Option<ProgressSink>,
    label: Option<String>,
}

impl ResumableTransfer {
    pub fn new(client: reqwest::Client, options: TransferOptions) -> Self {
        Self {
            client,
            options,
            control: TransferControl::new(),
            progress: None,
            label: None,
        }
    }

    pub fn with_control(mut self, control: TransferControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Name reported as `current_file` in progress snapshots
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn control(&self) -> &TransferControl {
        &self.control
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// HEAD the resource. Servers that refuse HEAD yield an empty probe.
    pub async fn probe(&self, url: &str) -> Result<RemoteInfo> {
        let url = secure_url(url, self.options.allow_insecure_loopback)?;
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| UpdateError::from_request(&url, e))?;

        if !response.status().is_success() {
            debug!("HEAD {} returned {}, probing skipped", url, response.status());
            return Ok(RemoteInfo::default());
        }
        Ok(RemoteInfo::from_headers(response.headers()))
    }

    /// Download `url` into `dest`, resuming a previous partial transfer when possible.
    ///
    /// Returns the number of bytes in the finished file.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let url = secure_url(url, self.options.allow_insecure_loopback)?;
        match self.run(&url, dest).await {
            Ok(bytes) => Ok(bytes),
            Err(e @ UpdateError::Cancelled) => {
                info!("Transfer of {} cancelled", url);
                TransferState::discard(dest);
                Err(e)
            }
            Err(e @ UpdateError::SizeLimitExceeded { .. }) => {
                warn!("Aborting transfer of {}: {}", url, e);
                TransferState::discard(dest);
                Err(e)
            }
            Err(e @ UpdateError::HttpStatus { .. }) => {
                // Nothing was received; drop the empty temp file unless an
                // earlier attempt left resumable progress behind
                if TransferState::load(dest).is_none() {
                    TransferState::discard(dest);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&self, url: &str, dest: &Path) -> Result<u64> {
        self.control.checkpoint().await?;

        let remote = self.probe(url).await?;
        if let Some(total) = remote.total_size {
            self.check_declared(url, total)?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = TransferState::temp_path(dest);
        let mut state = self.resume_point(url, dest, &remote).await;

        let mut file = if state.downloaded_size > 0 {
            let mut file = OpenOptions::new().write(true).open(&tmp).await?;
            file.set_len(state.downloaded_size).await?;
            file.seek(SeekFrom::Start(state.downloaded_size)).await?;
            file
        } else {
            File::create(&tmp).await?
        };

        let already_complete = state.downloaded_size > 0 && state.total_size == Some(state.downloaded_size);
        if !already_complete {
            let response = self.request(url, &mut state, &mut file).await?;
            state.save(dest)?;

            if let Err(e) = self.copy_body(url, dest, response, &mut file, &mut state).await {
                if !matches!(e, UpdateError::Cancelled | UpdateError::SizeLimitExceeded { .. }) {
                    // Keep what we have so the next attempt resumes
                    if let Err(flush_err) = file.flush().await {
                        warn!("Failed to flush partial download {:?}: {}", dest, flush_err);
                    }
                    if let Err(save_err) = state.save(dest) {
                        warn!("Failed to persist transfer state for {:?}: {}", dest, save_err);
                    }
                }
                return Err(e);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        replace_file(&tmp, dest)?;
        if let Err(e) = tokio::fs::remove_file(TransferState::state_path(dest)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove transfer state for {:?}: {}", dest, e);
            }
        }

        info!("Downloaded {} ({} bytes)", url, state.downloaded_size);
        Ok(state.downloaded_size)
    }

    /// Decide where to start: the persisted offset if still valid, otherwise zero.
    async fn resume_point(&self, url: &str, dest: &Path, remote: &RemoteInfo) -> TransferState {
        let mut fresh = TransferState::new(url, dest);
        fresh.total_size = remote.total_size;
        fresh.supports_resume = remote.supports_resume;
        fresh.etag = remote.etag.clone();
        fresh.last_modified = remote.last_modified.clone();

        let Some(saved) = TransferState::load(dest) else {
            return fresh;
        };
        if saved.url != url || saved.downloaded_size == 0 {
            return fresh;
        }
        if !remote.supports_resume {
            info!("Server does not support ranges for {}, restarting", url);
            return fresh;
        }
        if !saved.validators_match(remote.etag.as_deref(), remote.last_modified.as_deref()) {
            info!("Remote resource changed since last attempt, restarting {}", url);
            return fresh;
        }
        if let Some(total) = remote.total_size {
            if saved.downloaded_size > total {
                return fresh;
            }
        }
        let on_disk = tokio::fs::metadata(TransferState::temp_path(dest))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if on_disk < saved.downloaded_size {
            warn!("Partial file for {} is shorter than recorded, restarting", url);
            return fresh;
        }

        info!("Resuming {} from byte {}", url, saved.downloaded_size);
        TransferState {
            total_size: remote.total_size.or(saved.total_size),
            ..saved
        }
    }

    async fn request(&self, url: &str, state: &mut TransferState, file: &mut File) -> Result<Response> {
        let offset = state.downloaded_size;
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request
            .send()
            .await
            .map_err(|e| UpdateError::from_request(url, e))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                if let Some((start, total)) = content_range {
                    if start != offset {
                        return Err(UpdateError::network(
                            url,
                            format!("server resumed at byte {} instead of {}", start, offset),
                        ));
                    }
                    if total.is_some() {
                        state.total_size = total;
                    }
                }
            }
            StatusCode::OK => {
                if offset > 0 {
                    warn!("Server ignored range request for {}, restarting", url);
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                    state.downloaded_size = 0;
                }
                if let Some(len) = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                {
                    state.total_size = Some(len);
                }
            }
            status => {
                return Err(UpdateError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        if let Some(total) = state.total_size {
            self.check_declared(url, total)?;
        }
        Ok(response)
    }

    async fn copy_body(
        &self,
        url: &str,
        dest: &Path,
        response: Response,
        file: &mut File,
        state: &mut TransferState,
    ) -> Result<()> {
        let offset = state.downloaded_size;
        let tracker = Arc::new(Mutex::new(
            ProgressTracker::resuming(state.total_size.unwrap_or(0), offset)
                .with_label(self.label.clone()),
        ));

        let sink = self.progress.clone();
        let callback: ProgressCallback = Arc::new(move |session_bytes: u64| {
            let Some(sink) = &sink else { return };
            if let Ok(mut tracker) = tracker.lock() {
                sink(tracker.update(offset + session_bytes));
            }
        });
        let mut stream = ProgressStream::new(Box::pin(response.bytes_stream()), callback);

        let mut since_flush = 0u64;
        loop {
            self.control.checkpoint().await?;

            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.control.cancelled() => return Err(UpdateError::Cancelled),
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| UpdateError::from_request(url, e))?;

            let next_size = state.downloaded_size + chunk.len() as u64;
            self.check_actual(url, next_size, state)?;

            file.write_all(&chunk).await?;
            state.downloaded_size = next_size;
            since_flush += chunk.len() as u64;

            if since_flush >= self.options.flush_interval {
                file.flush().await?;
                state.save(dest)?;
                since_flush = 0;
            }
        }
        Ok(())
    }

    fn check_declared(&self, url: &str, total: u64) -> Result<()> {
        if total > self.options.max_file_size {
            return Err(UpdateError::SizeLimitExceeded {
                what: url.to_string(),
                size: total,
                limit: self.options.max_file_size,
            });
        }
        Ok(())
    }

    /// Reject bodies that run past the declared size by more than 10%.
    fn check_actual(&self, url: &str, size: u64, state: &mut TransferState) -> Result<()> {
        if size > self.options.max_file_size {
            return Err(UpdateError::SizeLimitExceeded {
                what: url.to_string(),
                size,
                limit: self.options.max_file_size,
            });
        }
        if let Some(total) = state.total_size {
            let allowed = total + total / SIZE_SLACK_DIVISOR;
            if size > allowed {
                return Err(UpdateError::SizeLimitExceeded {
                    what: url.to_string(),
                    size,
                    limit: allowed,
                });
            }
            if size > total {
                debug!("{} exceeds declared size {}, within slack", url, total);
                state.total_size = Some(size);
            }
        }
        Ok(())
    }
}
