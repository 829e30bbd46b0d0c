//! Throughput and ETA bookkeeping for artifact transfers.

use serde::Serialize;
use std::time::Instant;

/// Weight of the newest sample in the smoothed speed.
const SPEED_SMOOTHING: f64 = 0.3;

/// What a progress callback receives.
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    /// 0 when the server did not declare a length
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub percent_complete: f64,
    pub current_file: Option<String>,
}

impl TransferProgress {
    fn at(total_bytes: u64, transferred_bytes: u64, current_file: Option<String>) -> Self {
        let percent_complete = if total_bytes > 0 {
            (transferred_bytes as f64 * 100.0 / total_bytes as f64).min(100.0)
        } else {
            0.0
        };
        Self {
            total_bytes,
            transferred_bytes,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete,
            current_file,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.transferred_bytes >= self.total_bytes
    }
}

/// Turns a stream of absolute byte counts into progress snapshots.
///
/// Speed is an exponential moving average over update intervals so a
/// single slow read does not make the ETA jump around.
pub struct ProgressTracker {
    last_sample: Instant,
    last_bytes: u64,
    smoothed_speed: Option<f64>,
    snapshot: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self::resuming(total_bytes, 0)
    }

    /// Tracker for a transfer that already has `initial_bytes` on disk.
    /// Resumed bytes count toward the percentage but not the speed.
    pub fn resuming(total_bytes: u64, initial_bytes: u64) -> Self {
        Self {
            last_sample: Instant::now(),
            last_bytes: initial_bytes,
            smoothed_speed: None,
            snapshot: TransferProgress::at(total_bytes, initial_bytes, None),
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.snapshot.current_file = label;
        self
    }

    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        if elapsed > 0.0 {
            let instant = transferred_bytes.saturating_sub(self.last_bytes) as f64 / elapsed;
            let speed = match self.smoothed_speed {
                Some(prev) => SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * prev,
                None => instant,
            };
            self.smoothed_speed = Some(speed);
            self.last_sample = now;
            self.last_bytes = transferred_bytes;
        }

        let label = self.snapshot.current_file.take();
        let mut next = TransferProgress::at(self.snapshot.total_bytes, transferred_bytes, label);
        next.bytes_per_second = self.smoothed_speed.unwrap_or(0.0) as u64;
        if next.bytes_per_second > 0 {
            next.eta_seconds =
                next.total_bytes.saturating_sub(transferred_bytes) / next.bytes_per_second;
        }
        self.snapshot = next;
        &self.snapshot
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.snapshot
    }
}

/// `1536` -> `"1.50 KB"`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{}s", seconds),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}
