//! Source selection: mirror health, load balancing and failover.

pub mod mirror;
pub mod p2p;
pub mod predictive;
pub mod strategy;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, MirrorConfig};
use crate::fs::atomic::write_json_atomic;
use crate::transfer::{secure_url, DownloadManager};
use crate::{Result, UpdateError};

pub use mirror::Mirror;
pub use p2p::{PeerDirectory, SeedIndex};
pub use predictive::{LoadTrend, PredictiveModel};
pub use strategy::{StrategyKind, StrategyState};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub strategy: StrategyKind,
    pub region: Option<String>,
    /// File fetched with HEAD to probe a mirror
    pub probe_file: String,
    pub allow_insecure_loopback: bool,
}

impl SelectorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            strategy: config.updater.strategy,
            region: config.updater.region.clone(),
            probe_file: config.updater.version_file.clone(),
            allow_insecure_loopback: config.transfer.allow_insecure_loopback,
        }
    }
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            region: None,
            probe_file: "version.txt".to_string(),
            allow_insecure_loopback: false,
        }
    }
}

/// Where a fetched artifact came from
#[derive(Debug, Clone, PartialEq)]
pub enum FetchSource {
    Mirror(String),
    Peer,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub source: FetchSource,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    #[serde(flatten)]
    pub mirror: Mirror,
    pub score: f64,
    pub health_score: f64,
    pub predicted_response_time: f64,
    pub predicted_success_rate: f64,
    pub load_trend: LoadTrend,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectorStats {
    pub strategy: StrategyKind,
    pub total_mirrors: usize,
    pub active_mirrors: usize,
    pub mirrors: Vec<MirrorStats>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerformanceData {
    last_updated: DateTime<Utc>,
    mirrors: Vec<Mirror>,
}

struct Pool {
    mirrors: Vec<Mirror>,
    state: StrategyState,
    model: PredictiveModel,
}

impl Pool {
    fn find_mut(&mut self, url: &str) -> Option<&mut Mirror> {
        self.mirrors.iter_mut().find(|m| m.url == url)
    }
}

pub struct SourceSelector {
    client: reqwest::Client,
    options: SelectorOptions,
    pool: Mutex<Pool>,
    peers: Option<Arc<PeerDirectory>>,
}

impl SourceSelector {
    pub fn new(client: reqwest::Client, mirrors: &[MirrorConfig], options: SelectorOptions) -> Self {
        Self {
            client,
            options,
            pool: Mutex::new(Pool {
                mirrors: mirrors.iter().map(Mirror::from_config).collect(),
                state: StrategyState::default(),
                model: PredictiveModel::new(),
            }),
            peers: None,
        }
    }

    /// Add the peer path as the last-resort candidate.
    pub fn with_peers(mut self, peers: Arc<PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn strategy(&self) -> StrategyKind {
        self.options.strategy
    }

    pub async fn mirrors(&self) -> Vec<Mirror> {
        self.pool.lock().await.mirrors.clone()
    }

    async fn probe(&self, mirror_url: &str) -> std::result::Result<f64, String> {
        let url = crate::transfer::join_url(mirror_url, &self.options.probe_file);
        let url = secure_url(&url, self.options.allow_insecure_loopback).map_err(|e| e.to_string())?;
        let started = Instant::now();
        let response = self
            .client
            .head(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        Ok(started.elapsed().as_secs_f64())
    }

    fn apply_probe(pool: &mut Pool, url: &str, outcome: std::result::Result<f64, String>) -> bool {
        let Some(mirror) = pool.find_mut(url) else {
            return false;
        };
        match outcome {
            Ok(rt) => {
                mirror.record_probe_success(rt);
                debug!("Mirror {} is up ({:.2}s)", mirror.name, rt);
                pool.model.add_sample(url, rt, true, 0);
                true
            }
            Err(e) => {
                if mirror.record_probe_failure() {
                    warn!("Mirror {} deactivated after {} failures", mirror.name, mirror.failures);
                }
                debug!("Mirror {} is down: {}", mirror.name, e);
                pool.model.add_sample(url, PROBE_TIMEOUT.as_secs_f64(), false, 0);
                false
            }
        }
    }

    /// Probe one mirror and update its health.
    pub async fn check_health(&self, mirror_url: &str) -> bool {
        let outcome = self.probe(mirror_url).await;
        Self::apply_probe(&mut *self.pool.lock().await, mirror_url, outcome)
    }

    /// Probe every mirror concurrently. Returns the number of active mirrors.
    pub async fn check_all(&self) -> usize {
        let urls: Vec<String> = self.pool.lock().await.mirrors.iter().map(|m| m.url.clone()).collect();
        let outcomes = join_all(urls.iter().map(|url| self.probe(url))).await;

        let mut pool = self.pool.lock().await;
        for (url, outcome) in urls.iter().zip(outcomes) {
            Self::apply_probe(&mut pool, url, outcome);
        }
        let active = pool.mirrors.iter().filter(|m| m.active).count();
        info!("Active mirrors: {}/{}", active, pool.mirrors.len());
        active
    }

    /// Pick a mirror with the configured strategy.
    pub async fn select_best(&self) -> Result<Mirror> {
        let mut guard = self.pool.lock().await;
        let pool = &mut *guard;
        let candidates: Vec<&Mirror> = pool.mirrors.iter().filter(|m| m.active).collect();
        if candidates.is_empty() {
            warn!("No active mirrors");
            return Err(UpdateError::NoSourceAvailable);
        }

        let index = strategy::pick(
            self.options.strategy,
            &candidates,
            &mut pool.state,
            &pool.model,
            self.options.region.as_deref(),
        );
        let chosen = candidates[index].clone();
        info!(
            "Selected mirror {} (response time: {}, success rate: {:.1}%)",
            chosen.name,
            chosen
                .response_time
                .map(|rt| format!("{:.2}s", rt))
                .unwrap_or_else(|| "unknown".to_string()),
            chosen.success_rate * 100.0
        );
        Ok(chosen)
    }

    /// Next-best active mirrors by (priority, response time), excluding `exclude`.
    pub async fn fallback_mirrors(&self, exclude: &str, count: usize) -> Vec<Mirror> {
        let pool = self.pool.lock().await;
        let mut rest: Vec<Mirror> = pool
            .mirrors
            .iter()
            .filter(|m| m.active && m.url != exclude)
            .cloned()
            .collect();
        rest.sort_by(|a, b| {
            let (pa, ra) = a.fallback_key();
            let (pb, rb) = b.fallback_key();
            pa.cmp(&pb).then(ra.total_cmp(&rb))
        });
        rest.truncate(count);
        rest
    }

    /// Feed a transfer outcome back into the mirror's health.
    pub async fn record_transfer(&self, mirror_url: &str, elapsed: f64, success: bool, bytes: u64) {
        let mut pool = self.pool.lock().await;
        pool.model.add_sample(mirror_url, elapsed, success, bytes);
        if let Some(mirror) = pool.find_mut(mirror_url) {
            let bandwidth = if elapsed > 0.0 {
                bytes as f64 / 1024.0 / 1024.0 / elapsed
            } else {
                0.0
            };
            if mirror.record_transfer(success, bandwidth) {
                warn!("Mirror {} demoted after repeated transfer failures", mirror.name);
            }
        }
    }

    async fn set_connections(&self, mirror_url: &str, delta: isize) {
        let mut pool = self.pool.lock().await;
        if let Some(mirror) = pool.find_mut(mirror_url) {
            mirror.active_connections = mirror.active_connections.saturating_add_signed(delta);
        }
    }

    /// Fetch `name` from the best mirror, then up to two fallbacks, then peers.
    ///
    /// Peers are only consulted when `expected_hash` is known.
    pub async fn download_with_fallback(
        &self,
        downloads: &DownloadManager,
        name: &str,
        dest: &Path,
        expected_hash: Option<&str>,
    ) -> Result<FetchOutcome> {
        let mut last_error = None;
        let mut attempts = Vec::new();
        match self.select_best().await {
            Ok(best) => {
                let fallbacks = self.fallback_mirrors(&best.url, FALLBACK_COUNT).await;
                attempts.push(best);
                attempts.extend(fallbacks);
            }
            Err(e) => last_error = Some(e),
        }

        for mirror in attempts {
            let url = mirror.resource_url(name);
            self.set_connections(&mirror.url, 1).await;
            let started = Instant::now();
            let result = downloads.fetch(&url, dest).await;
            let elapsed = started.elapsed().as_secs_f64();
            self.set_connections(&mirror.url, -1).await;

            match result {
                Ok(bytes) => {
                    self.record_transfer(&mirror.url, elapsed, true, bytes).await;
                    info!("Fetched {} from mirror {}", name, mirror.name);
                    return Ok(FetchOutcome {
                        source: FetchSource::Mirror(mirror.url),
                        bytes,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e @ UpdateError::HttpStatus { status: 404, .. }) => {
                    debug!("{} not present on mirror {}", name, mirror.name);
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("Fetching {} from mirror {} failed: {}", name, mirror.name, e);
                    self.record_transfer(&mirror.url, elapsed, false, 0).await;
                    last_error = Some(e);
                }
            }
        }

        if let (Some(peers), Some(hash)) = (&self.peers, expected_hash) {
            match peers.fetch(hash, dest).await {
                Ok(true) => {
                    let bytes = tokio::fs::metadata(dest).await?.len();
                    return Ok(FetchOutcome {
                        source: FetchSource::Peer,
                        bytes,
                    });
                }
                Ok(false) => debug!("No peer could supply {}", name),
                Err(e) => warn!("Peer fetch of {} failed: {}", name, e),
            }
        }

        warn!("Could not fetch {} from any source", name);
        Err(last_error.unwrap_or(UpdateError::NoSourceAvailable))
    }

    pub async fn stats(&self) -> SelectorStats {
        let pool = self.pool.lock().await;
        SelectorStats {
            strategy: self.options.strategy,
            total_mirrors: pool.mirrors.len(),
            active_mirrors: pool.mirrors.iter().filter(|m| m.active).count(),
            mirrors: pool
                .mirrors
                .iter()
                .map(|m| MirrorStats {
                    mirror: m.clone(),
                    score: m.score(),
                    health_score: m.health_score(),
                    predicted_response_time: pool.model.predict_response_time(&m.url),
                    predicted_success_rate: pool.model.predict_success_probability(&m.url),
                    load_trend: pool.model.load_trend(&m.url),
                })
                .collect(),
        }
    }

    pub async fn save_performance(&self, path: &Path) -> Result<()> {
        let data = PerformanceData {
            last_updated: Utc::now(),
            mirrors: self.mirrors().await,
        };
        write_json_atomic(path, &data)?;
        Ok(())
    }

    /// Restore health fields for configured mirrors. Unknown URLs are ignored.
    pub async fn load_performance(&self, path: &Path) -> Result<usize> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let data: PerformanceData = serde_json::from_slice(&raw)?;

        let mut pool = self.pool.lock().await;
        let mut restored = 0;
        for saved in data.mirrors {
            if let Some(mirror) = pool.find_mut(&saved.url) {
                mirror.response_time = saved.response_time;
                mirror.success_rate = saved.success_rate;
                mirror.bandwidth = saved.bandwidth;
                mirror.failures = saved.failures;
                mirror.total_requests = saved.total_requests;
                mirror.last_checked = saved.last_checked;
                mirror.active = saved.active;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(url: &str, priority: u32) -> MirrorConfig {
        MirrorConfig {
            url: url.to_string(),
            name: None,
            region: "eu".to_string(),
            priority,
        }
    }

    fn selector(urls: &[(&str, u32)]) -> SourceSelector {
        let configs: Vec<MirrorConfig> = urls.iter().map(|(u, p)| config(u, *p)).collect();
        SourceSelector::new(reqwest::Client::new(), &configs, SelectorOptions::default())
    }

    async fn set_health(selector: &SourceSelector, url: &str, rt: f64, sr: f64) {
        let mut pool = selector.pool.lock().await;
        let mirror = pool.find_mut(url).unwrap();
        mirror.response_time = Some(rt);
        mirror.success_rate = sr;
    }

    #[tokio::test]
    async fn test_select_best_prefers_lower_score() -> Result<()> {
        let selector = selector(&[("https://a.example.com", 1), ("https://b.example.com", 1)]);
        set_health(&selector, "https://a.example.com", 0.5, 0.9).await;
        set_health(&selector, "https://b.example.com", 0.1, 0.99).await;

        assert_eq!(selector.select_best().await?.url, "https://b.example.com");
        Ok(())
    }

    #[tokio::test]
    async fn test_no_active_mirrors() {
        let selector = selector(&[("https://a.example.com", 1)]);
        {
            let mut pool = selector.pool.lock().await;
            for _ in 0..3 {
                pool.find_mut("https://a.example.com").unwrap().record_probe_failure();
            }
        }
        assert!(matches!(
            selector.select_best().await,
            Err(UpdateError::NoSourceAvailable)
        ));
    }

    #[tokio::test]
    async fn test_fallbacks_ordered_and_capped() {
        let selector = selector(&[
            ("https://a.example.com", 1),
            ("https://b.example.com", 3),
            ("https://c.example.com", 2),
            ("https://d.example.com", 2),
        ]);
        set_health(&selector, "https://c.example.com", 0.4, 1.0).await;
        set_health(&selector, "https://d.example.com", 0.2, 1.0).await;

        let fallbacks: Vec<String> = selector
            .fallback_mirrors("https://a.example.com", 2)
            .await
            .into_iter()
            .map(|m| m.url)
            .collect();
        assert_eq!(fallbacks, vec!["https://d.example.com", "https://c.example.com"]);
    }

    #[tokio::test]
    async fn test_transfer_feedback() {
        let selector = selector(&[("https://a.example.com", 1)]);
        for _ in 0..5 {
            selector.record_transfer("https://a.example.com", 1.0, false, 0).await;
        }
        let stats = selector.stats().await;
        assert_eq!(stats.active_mirrors, 0);
        assert_eq!(stats.mirrors[0].mirror.failures, 5);
        assert_eq!(stats.mirrors[0].predicted_success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_performance_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("mirror_performance.json");

        let first = selector(&[("https://a.example.com", 1)]);
        set_health(&first, "https://a.example.com", 0.25, 0.75).await;
        first.save_performance(&path).await?;

        let second = selector(&[("https://a.example.com", 1), ("https://b.example.com", 2)]);
        assert_eq!(second.load_performance(&path).await?, 1);
        let mirrors = second.mirrors().await;
        assert_eq!(mirrors[0].response_time, Some(0.25));
        assert_eq!(mirrors[1].response_time, None);

        assert_eq!(second.load_performance(&dir.path().join("missing.json")).await?, 0);
        Ok(())
    }
}
