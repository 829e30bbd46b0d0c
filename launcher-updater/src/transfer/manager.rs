//! Registry of in-flight downloads.
//!
//! Every transfer gets an id, a destination and a control handle. Only one
//! transfer may write to a given destination at a time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::bandwidth::{
    self, AdaptiveBandwidthController, BandwidthMonitor, BandwidthStats, ConnectionProfile,
};
use super::chunked::ChunkedDownloader;
use super::control::{ControlState, TransferControl};
use super::progress::{format_speed, TransferProgress};
use super::resumable::{ProgressSink, ResumableTransfer, TransferOptions};
use super::state::TransferState;
use crate::config::TransferConfig;
use crate::events::{EventBus, TransferProgressPayload, UpdateEvent};
use crate::{Result, UpdateError};

struct ActiveTransfer {
    url: String,
    dest: PathBuf,
    control: TransferControl,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub id: String,
    pub url: String,
    pub dest: PathBuf,
    pub paused: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    options: TransferOptions,
    parallel_threshold: u64,
    monitor: Arc<Mutex<BandwidthMonitor>>,
    controller: Arc<Mutex<AdaptiveBandwidthController>>,
    active: Arc<RwLock<HashMap<String, ActiveTransfer>>>,
    events: Option<EventBus>,
}

impl DownloadManager {
    pub fn new(client: reqwest::Client, options: TransferOptions, parallel_threshold: u64) -> Self {
        Self {
            client,
            options,
            parallel_threshold,
            monitor: Arc::new(Mutex::new(BandwidthMonitor::new())),
            controller: Arc::new(Mutex::new(AdaptiveBandwidthController::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            events: None,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &TransferConfig) -> Self {
        Self::new(client, TransferOptions::from_config(config), config.parallel_threshold)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Measure the link against `url` and retune the connection model.
    pub async fn calibrate(&self, url: &str) -> Result<ConnectionProfile> {
        let url = super::secure_url(url, self.options.allow_insecure_loopback)?;
        let speed = bandwidth::calibrate(&self.client, &url).await;
        let profile = ConnectionProfile::classify(speed);
        info!("Connection calibrated at {:.2} MB/s ({:?})", speed, profile);
        self.controller.lock().await.apply_profile(profile);
        Ok(profile)
    }

    pub async fn bandwidth_stats(&self) -> BandwidthStats {
        self.monitor.lock().await.stats()
    }

    /// Register a transfer without starting it.
    pub async fn add(&self, url: &str, dest: &Path) -> Result<String> {
        let mut active = self.active.write().await;
        if active.values().any(|t| t.dest == dest) {
            return Err(UpdateError::AlreadyActive(dest.to_path_buf()));
        }
        let id = Uuid::new_v4().to_string();
        active.insert(
            id.clone(),
            ActiveTransfer {
                url: url.to_string(),
                dest: dest.to_path_buf(),
                control: TransferControl::new(),
                started_at: Utc::now(),
            },
        );
        debug!("Registered transfer {} for {}", id, url);
        Ok(id)
    }

    /// Run a registered transfer to completion.
    pub async fn start(&self, id: &str) -> Result<u64> {
        let (url, dest, control) = {
            let active = self.active.read().await;
            let transfer = active
                .get(id)
                .ok_or_else(|| UpdateError::Config(format!("Unknown transfer id: {}", id)))?;
            (transfer.url.clone(), transfer.dest.clone(), transfer.control.clone())
        };

        let result = self.run(id, &url, &dest, control).await;
        self.active.write().await.remove(id);

        if let (Ok(bytes), Some(events)) = (&result, &self.events) {
            events.emit(UpdateEvent::TransferCompleted {
                id: id.to_string(),
                bytes: *bytes,
            });
        }
        result
    }

    /// Register and run in one step.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let id = self.add(url, dest).await?;
        self.start(&id).await
    }

    async fn run(&self, id: &str, url: &str, dest: &Path, control: TransferControl) -> Result<u64> {
        let sink = self.progress_sink(id, url);
        let single = ResumableTransfer::new(self.client.clone(), self.options.clone())
            .with_control(control.clone())
            .with_label(url);
        let single = match &sink {
            Some(sink) => single.with_progress(sink.clone()),
            None => single,
        };

        // Partial single-stream progress always resumes single-stream
        let has_partial = TransferState::load(dest).is_some();
        if !has_partial {
            let remote = single.probe(url).await?;
            if let Some(total) = remote.total_size {
                if remote.supports_resume && total >= self.parallel_threshold {
                    let parallel = ChunkedDownloader::new(
                        self.client.clone(),
                        self.options.clone(),
                        self.monitor.clone(),
                        self.controller.clone(),
                    )
                    .with_control(control);
                    let parallel = match sink {
                        Some(sink) => parallel.with_progress(sink),
                        None => parallel,
                    };
                    return parallel.download(url, dest, total).await;
                }
            }
        }

        let started = std::time::Instant::now();
        let bytes = single.fetch(url, dest).await?;
        self.monitor.lock().await.add_sample(bytes, started.elapsed());
        Ok(bytes)
    }

    fn progress_sink(&self, id: &str, url: &str) -> Option<ProgressSink> {
        let events = self.events.clone()?;
        let id = id.to_string();
        let url = url.to_string();
        Some(Arc::new(move |progress: &TransferProgress| {
            events.emit(UpdateEvent::TransferProgress(TransferProgressPayload {
                id: id.clone(),
                url: url.clone(),
                percent: progress.percent_complete,
                transferred_bytes: progress.transferred_bytes,
                total_bytes: progress.total_bytes,
                bytes_per_second: progress.bytes_per_second,
                eta_seconds: progress.eta_seconds,
                speed: format_speed(progress.bytes_per_second),
            }));
        }))
    }

    pub async fn pause(&self, id: &str) -> bool {
        self.with_control(id, TransferControl::pause).await
    }

    pub async fn resume(&self, id: &str) -> bool {
        self.with_control(id, TransferControl::resume).await
    }

    /// Cancel a transfer; its temp and state files are deleted when it stops.
    pub async fn cancel(&self, id: &str) -> bool {
        self.with_control(id, TransferControl::cancel).await
    }

    async fn with_control(&self, id: &str, action: fn(&TransferControl)) -> bool {
        let active = self.active.read().await;
        match active.get(id) {
            Some(transfer) => {
                action(&transfer.control);
                true
            }
            None => false,
        }
    }

    /// Persisted progress for a registered transfer, if any was written yet.
    pub async fn state(&self, id: &str) -> Option<TransferState> {
        let dest = self.active.read().await.get(id)?.dest.clone();
        TransferState::load(&dest)
    }

    pub async fn list_active(&self) -> Vec<TransferSummary> {
        let active = self.active.read().await;
        let mut list: Vec<TransferSummary> = active
            .iter()
            .map(|(id, t)| TransferSummary {
                id: id.clone(),
                url: t.url.clone(),
                dest: t.dest.clone(),
                paused: t.control.state() == ControlState::Paused,
                started_at: t.started_at,
            })
            .collect();
        list.sort_by_key(|t| t.started_at);
        list
    }

    pub async fn running_count(&self) -> usize {
        self.active.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DownloadManager {
        DownloadManager::new(reqwest::Client::new(), TransferOptions::default(), 8 * 1024 * 1024)
    }

    #[tokio::test]
    async fn test_one_transfer_per_destination() -> Result<()> {
        let manager = manager();
        let dest = Path::new("/tmp/launcher-test/a.zip");
        manager.add("https://cdn.example.com/a.zip", dest).await?;

        let second = manager.add("https://mirror.example.com/a.zip", dest).await;
        assert!(matches!(second, Err(UpdateError::AlreadyActive(_))));

        manager
            .add("https://cdn.example.com/b.zip", Path::new("/tmp/launcher-test/b.zip"))
            .await?;
        assert_eq!(manager.running_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_controls_on_registered_transfer() -> Result<()> {
        let manager = manager();
        let id = manager
            .add("https://cdn.example.com/a.zip", Path::new("/tmp/launcher-test/c.zip"))
            .await?;

        assert!(manager.pause(&id).await);
        let listed = manager.list_active().await;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].paused);

        assert!(manager.resume(&id).await);
        assert!(!manager.list_active().await[0].paused);

        assert!(manager.cancel(&id).await);
        assert!(!manager.pause("missing").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_unknown_id() {
        let manager = manager();
        assert!(manager.start("nope").await.is_err());
    }
}
