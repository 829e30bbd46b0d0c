//! Parallel range download for large artifacts.
//!
//! The file is split into one contiguous range per connection as planned by
//! the [`AdaptiveBandwidthController`]. Each range lands in its own
//! `<dest>.chunkN` file, and the pieces are concatenated in order once all
//! of them finished. Throughput of the whole download feeds back into the
//! controller.

use futures_util::future::join_all;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bandwidth::{record_throughput, AdaptiveBandwidthController, BandwidthMonitor, ChunkRange};
use super::control::TransferControl;
use super::progress::ProgressTracker;
use super::progress_stream::PROGRESS_INTERVAL;
use super::resumable::{ProgressSink, TransferOptions};
use super::secure_url;
use crate::fs::atomic::{discard_file_async, replace_file, temp_sibling};
use crate::{Result, UpdateError};

const CHUNK_ATTEMPTS: u32 = 3;

pub struct ChunkedDownloader {
    client: reqwest::Client,
    options: TransferOptions,
    monitor: Arc<Mutex<BandwidthMonitor>>,
    controller: Arc<Mutex<AdaptiveBandwidthController>>,
    control: TransferControl,
    progress: Option<ProgressSink>,
}

impl ChunkedDownloader {
    pub fn new(
        client: reqwest::Client,
        options: TransferOptions,
        monitor: Arc<Mutex<BandwidthMonitor>>,
        controller: Arc<Mutex<AdaptiveBandwidthController>>,
    ) -> Self {
        Self {
            client,
            options,
            monitor,
            controller,
            control: TransferControl::new(),
            progress: None,
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

    pub fn chunk_path(dest: &Path, index: usize) -> PathBuf {
        temp_sibling(dest, &format!(".chunk{}", index))
    }

    /// Download `total_size` bytes of `url` into `dest` over parallel ranges.
    pub async fn download(&self, url: &str, dest: &Path, total_size: u64) -> Result<u64> {
        let url = secure_url(url, self.options.allow_insecure_loopback)?;
        if total_size > self.options.max_file_size {
            return Err(UpdateError::SizeLimitExceeded {
                what: url,
                size: total_size,
                limit: self.options.max_file_size,
            });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let chunks = self.controller.lock().await.plan_chunks(total_size);
        let paths: Vec<PathBuf> = chunks.iter().map(|c| Self::chunk_path(dest, c.index)).collect();
        info!("Downloading {} in {} parallel chunk(s)", url, chunks.len());

        let started = Instant::now();
        let result = self.fetch_all(&url, &chunks, &paths, total_size).await;
        let result = match result {
            Ok(()) => merge_chunks(&paths, dest, total_size).await,
            Err(e) => Err(e),
        };

        for path in &paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove chunk file {:?}: {}", path, e);
                }
            }
        }
        result?;

        let elapsed = started.elapsed();
        self.record(total_size, elapsed).await;
        info!(
            "Parallel download of {} finished in {:.1}s",
            url,
            elapsed.as_secs_f64()
        );
        Ok(total_size)
    }

    async fn fetch_all(
        &self,
        url: &str,
        chunks: &[ChunkRange],
        paths: &[PathBuf],
        total_size: u64,
    ) -> Result<()> {
        let downloaded = Arc::new(AtomicU64::new(0));
        let work = join_all(chunks.iter().zip(paths).map(|(chunk, path)| {
            fetch_chunk(
                &self.client,
                url,
                *chunk,
                path,
                &self.control,
                downloaded.clone(),
            )
        }));
        tokio::pin!(work);

        let mut tracker = ProgressTracker::new(total_size);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        let results = loop {
            tokio::select! {
                results = &mut work => break results,
                _ = ticker.tick() => {
                    if let Some(sink) = &self.progress {
                        sink(tracker.update(downloaded.load(Ordering::Relaxed)));
                    }
                }
            }
        };
        if let Some(sink) = &self.progress {
            sink(tracker.update(downloaded.load(Ordering::Relaxed)));
        }

        let mut first_error = None;
        for result in results {
            match result {
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) if first_error.is_none() => first_error = Some(e),
                _ => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn record(&self, bytes: u64, elapsed: Duration) {
        let mut monitor = self.monitor.lock().await;
        let mut controller = self.controller.lock().await;
        record_throughput(&mut monitor, &mut controller, bytes, elapsed);
    }
}

/// Fetch one range with up to three attempts and exponential backoff.
async fn fetch_chunk(
    client: &reqwest::Client,
    url: &str,
    chunk: ChunkRange,
    path: &Path,
    control: &TransferControl,
    downloaded: Arc<AtomicU64>,
) -> Result<()> {
    let mut last_error = UpdateError::network(url, "chunk never attempted");
    for attempt in 0..CHUNK_ATTEMPTS {
        control.checkpoint().await?;
        let mut counted = 0u64;
        match try_chunk(client, url, chunk, path, control, &downloaded, &mut counted).await {
            Ok(()) => {
                debug!("Chunk {} ({}) complete", chunk.index, chunk.header_value());
                return Ok(());
            }
            Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
            Err(e) => {
                downloaded.fetch_sub(counted, Ordering::Relaxed);
                warn!(
                    "Chunk {} of {} failed (attempt {}): {}",
                    chunk.index,
                    url,
                    attempt + 1,
                    e
                );
                last_error = e;
            }
        }

        if attempt + 1 < CHUNK_ATTEMPTS {
            let backoff = Duration::from_secs(1 << attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = control.cancelled() => return Err(UpdateError::Cancelled),
            }
        }
    }
    Err(last_error)
}

async fn try_chunk(
    client: &reqwest::Client,
    url: &str,
    chunk: ChunkRange,
    path: &Path,
    control: &TransferControl,
    downloaded: &AtomicU64,
    counted: &mut u64,
) -> Result<()> {
    let response = client
        .get(url)
        .header(RANGE, chunk.header_value())
        .send()
        .await
        .map_err(|e| UpdateError::from_request(url, e))?;

    let status = response.status();
    let whole_file = chunk.start == 0 && status == StatusCode::OK;
    if status != StatusCode::PARTIAL_CONTENT && !whole_file {
        return Err(UpdateError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let expected = chunk.size();
    let mut file = File::create(path).await?;
    let mut stream = Box::pin(response.bytes_stream());
    let mut written = 0u64;

    loop {
        control.checkpoint().await?;
        let next = tokio::select! {
            next = stream.next() => next,
            _ = control.cancelled() => return Err(UpdateError::Cancelled),
        };
        let Some(bytes) = next else { break };
        let bytes = bytes.map_err(|e| UpdateError::from_request(url, e))?;

        if written + bytes.len() as u64 > expected {
            return Err(UpdateError::network(
                url,
                format!("chunk {} overran its range", chunk.index),
            ));
        }
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;
        *counted += bytes.len() as u64;
        downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
    file.flush().await?;

    if written != expected {
        return Err(UpdateError::network(
            url,
            format!("chunk {} short: {} of {} bytes", chunk.index, written, expected),
        ));
    }
    Ok(())
}

/// Concatenate chunk files in order, then move the result onto `dest`.
async fn merge_chunks(paths: &[PathBuf], dest: &Path, total_size: u64) -> Result<()> {
    let tmp = temp_sibling(dest, ".tmp");
    let mut output = File::create(&tmp).await?;
    let mut merged = 0u64;
    for path in paths {
        let mut input = File::open(path).await?;
        merged += tokio::io::copy(&mut input, &mut output).await?;
    }
    output.flush().await?;
    output.sync_all().await?;
    drop(output);

    if merged != total_size {
        discard_file_async(&tmp).await;
        return Err(UpdateError::IntegrityFailure(format!(
            "merged {} bytes, expected {}",
            merged, total_size
        )));
    }
    replace_file(&tmp, dest)?;
    Ok(())
}
