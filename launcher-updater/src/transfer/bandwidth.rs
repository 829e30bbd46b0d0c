//! Throughput sampling and the adaptive connection/chunk-size model.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MONITOR_SAMPLES: usize = 100;
const PERFORMANCE_HISTORY: usize = 10;

pub const MIN_CONNECTIONS: usize = 1;
pub const MAX_CONNECTIONS_LIMIT: usize = 16;
pub const DEFAULT_CONNECTIONS: usize = 4;

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Fallback estimate when calibration cannot measure anything
const FALLBACK_BANDWIDTH_MBPS: f64 = 1.0;
const CALIBRATION_ROUNDS: usize = 3;

fn bytes_to_mb(bytes: f64) -> f64 {
    bytes / 1024.0 / 1024.0
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BandwidthStats {
    pub current_speed_mbps: f64,
    pub average_speed_mbps: f64,
    pub peak_speed_mbps: f64,
    pub samples_count: usize,
}

/// Rolling window of the last 100 throughput samples, in MB/s
#[derive(Debug, Default)]
pub struct BandwidthMonitor {
    samples: VecDeque<f64>,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MONITOR_SAMPLES),
        }
    }

    /// Record `bytes` moved in `elapsed`; zero-length intervals are ignored.
    pub fn add_sample(&mut self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        if self.samples.len() == MONITOR_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes_to_mb(bytes as f64) / secs);
    }

    pub fn current_speed(&self) -> f64 {
        self.samples.back().copied().unwrap_or(0.0)
    }

    pub fn average_speed(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn peak_speed(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn stats(&self) -> BandwidthStats {
        BandwidthStats {
            current_speed_mbps: self.current_speed(),
            average_speed_mbps: self.average_speed(),
            peak_speed_mbps: self.peak_speed(),
            samples_count: self.samples.len(),
        }
    }
}

/// Connection class derived from a calibration measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProfile {
    Broadband,
    Mobile,
    Slow,
}

impl ConnectionProfile {
    pub fn classify(bandwidth_mbps: f64) -> Self {
        if bandwidth_mbps >= 10.0 {
            ConnectionProfile::Broadband
        } else if bandwidth_mbps >= 1.0 {
            ConnectionProfile::Mobile
        } else {
            ConnectionProfile::Slow
        }
    }

    /// (connection limit, starting connections)
    pub fn connection_settings(self) -> (usize, usize) {
        match self {
            ConnectionProfile::Broadband => (16, 8),
            ConnectionProfile::Mobile => (8, 4),
            ConnectionProfile::Slow => (4, 2),
        }
    }
}

/// Byte range `[start, end]` (inclusive) fetched by one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Tunes connection count and chunk size from observed throughput
#[derive(Debug)]
pub struct AdaptiveBandwidthController {
    current_connections: usize,
    max_connections: usize,
    chunk_size: u64,
    performance_history: VecDeque<f64>,
}

impl AdaptiveBandwidthController {
    pub fn new() -> Self {
        Self::with_connections(DEFAULT_CONNECTIONS)
    }

    pub fn with_connections(connections: usize) -> Self {
        Self {
            current_connections: connections.clamp(MIN_CONNECTIONS, MAX_CONNECTIONS_LIMIT),
            max_connections: MAX_CONNECTIONS_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            performance_history: VecDeque::with_capacity(PERFORMANCE_HISTORY),
        }
    }

    pub fn connections(&self) -> usize {
        self.current_connections
    }

    pub fn connection_limit(&self) -> usize {
        self.max_connections
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn apply_profile(&mut self, profile: ConnectionProfile) {
        let (limit, start) = profile.connection_settings();
        self.max_connections = limit;
        self.current_connections = start;
        info!(
            "Connection profile {:?}: {} connections (limit {})",
            profile, start, limit
        );
    }

    /// Feed one measurement. Adjusts once three ratios are known.
    pub fn analyze_performance(&mut self, actual_speed: f64, target_speed: f64) {
        let ratio = actual_speed / target_speed.max(0.1);
        if self.performance_history.len() == PERFORMANCE_HISTORY {
            self.performance_history.pop_front();
        }
        self.performance_history.push_back(ratio);

        if self.performance_history.len() < 3 {
            return;
        }

        let recent: f64 = self.performance_history.iter().rev().take(3).sum::<f64>() / 3.0;
        if recent < 0.8 {
            self.increase_aggressiveness();
        } else if recent > 1.2 {
            self.decrease_aggressiveness();
        }
    }

    fn increase_aggressiveness(&mut self) {
        if self.current_connections < self.max_connections {
            self.current_connections += 1;
            debug!("Increased connections to {}", self.current_connections);
        }
        if self.chunk_size < MAX_CHUNK_SIZE {
            self.chunk_size = ((self.chunk_size as f64 * 1.5) as u64).min(MAX_CHUNK_SIZE);
            debug!("Increased chunk size to {}KB", self.chunk_size / 1024);
        }
    }

    fn decrease_aggressiveness(&mut self) {
        if self.current_connections > MIN_CONNECTIONS {
            self.current_connections -= 1;
            debug!("Decreased connections to {}", self.current_connections);
        }
        if self.chunk_size > MIN_CHUNK_SIZE {
            self.chunk_size = ((self.chunk_size as f64 * 0.8) as u64).max(MIN_CHUNK_SIZE);
            debug!("Decreased chunk size to {}KB", self.chunk_size / 1024);
        }
    }

    /// Small files get quarter-sized chunks, never below the minimum.
    pub fn optimal_chunk_size(&self, file_size: u64) -> u64 {
        if file_size < self.chunk_size * 2 {
            return (file_size / 4).max(MIN_CHUNK_SIZE);
        }
        self.chunk_size
    }

    /// Split `file_size` bytes into one contiguous range per connection.
    pub fn plan_chunks(&self, file_size: u64) -> Vec<ChunkRange> {
        if file_size == 0 {
            return Vec::new();
        }
        let chunk = self.optimal_chunk_size(file_size);
        let count = (self.current_connections as u64).min((file_size / chunk).max(1));
        let part = file_size / count;

        (0..count)
            .map(|i| {
                let start = i * part;
                let end = if i == count - 1 {
                    file_size - 1
                } else {
                    start + part - 1
                };
                ChunkRange {
                    index: i as usize,
                    start,
                    end,
                }
            })
            .collect()
    }
}

impl Default for AdaptiveBandwidthController {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate bandwidth in MB/s from three small fetches of `url`.
pub async fn calibrate(client: &reqwest::Client, url: &str) -> f64 {
    let mut speeds = Vec::with_capacity(CALIBRATION_ROUNDS);
    for _ in 0..CALIBRATION_ROUNDS {
        let started = Instant::now();
        let bytes = match client.get(url).send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(body) => body.len(),
                Err(e) => {
                    warn!("Calibration read from {} failed: {}", url, e);
                    continue;
                }
            },
            Ok(response) => {
                warn!("Calibration request to {} returned {}", url, response.status());
                continue;
            }
            Err(e) => {
                warn!("Calibration request to {} failed: {}", url, e);
                continue;
            }
        };
        let secs = started.elapsed().as_secs_f64();
        if secs > 0.0 {
            speeds.push(bytes_to_mb(bytes as f64) / secs);
        }
    }

    if speeds.is_empty() {
        return FALLBACK_BANDWIDTH_MBPS;
    }
    speeds.iter().sum::<f64>() / speeds.len() as f64
}

/// Judge one finished download against the speed seen so far, then add
/// it to the history. The first measurement only sets the baseline.
pub fn record_throughput(
    monitor: &mut BandwidthMonitor,
    controller: &mut AdaptiveBandwidthController,
    bytes: u64,
    elapsed: Duration,
) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return;
    }
    let target = monitor.average_speed();
    monitor.add_sample(bytes, elapsed);
    if target > 0.0 {
        controller.analyze_performance(bytes_to_mb(bytes as f64) / secs, target);
    }
}
