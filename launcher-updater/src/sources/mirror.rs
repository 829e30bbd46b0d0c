//! Mirror health bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MirrorConfig;
use crate::transfer::join_url;

/// Failed probes before a mirror is taken out of rotation
pub const PROBE_FAILURE_LIMIT: u32 = 3;
/// Failed transfers before demotion, together with the success-rate floor
pub const TRANSFER_FAILURE_LIMIT: u32 = 5;
pub const TRANSFER_SUCCESS_FLOOR: f64 = 0.5;

const MAX_CONNECTIONS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    pub url: String,
    pub name: String,
    pub region: String,
    /// 1 is the most preferred
    pub priority: u32,
    /// Seconds; `None` until the first probe or transfer
    pub response_time: Option<f64>,
    pub success_rate: f64,
    /// MB/s observed during the last transfer
    pub bandwidth: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub failures: u32,
    pub total_requests: u64,
    pub active: bool,
    #[serde(skip)]
    pub active_connections: usize,
}

impl Mirror {
    pub fn new(url: &str, name: &str, region: &str, priority: u32) -> Self {
        Self {
            url: url.to_string(),
            name: name.to_string(),
            region: region.to_string(),
            priority,
            response_time: None,
            success_rate: 1.0,
            bandwidth: 0.0,
            last_checked: None,
            failures: 0,
            total_requests: 0,
            active: true,
            active_connections: 0,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        let name = config.name.clone().unwrap_or_else(|| config.url.clone());
        Self::new(&config.url, &name, &config.region, config.priority)
    }

    pub fn resource_url(&self, name: &str) -> String {
        join_url(&self.url, name)
    }

    fn response_time_or_inf(&self) -> f64 {
        self.response_time.unwrap_or(f64::INFINITY)
    }

    /// Lower is better. Priority dominates, then latency, then reliability.
    pub fn score(&self) -> f64 {
        self.priority as f64 * 100.0
            + self.response_time_or_inf() * 1000.0
            + (1.0 - self.success_rate) * 10000.0
    }

    /// Ordering key for fallback candidates.
    pub fn fallback_key(&self) -> (u32, f64) {
        (self.priority, self.response_time_or_inf())
    }

    /// Combined health in `[0, 1]` used by the geographic and predictive strategies.
    pub fn health_score(&self) -> f64 {
        let mut score = 1.0;
        if let Some(rt) = self.response_time.filter(|rt| *rt > 0.0) {
            score *= (1.0 - (rt - 0.1) / 5.0).max(0.1);
        }
        score *= self.success_rate;
        score *= (1.0 - self.active_connections as f64 / MAX_CONNECTIONS as f64).max(0.1);
        if self.failures > 0 {
            score *= (1.0 - self.failures as f64 * 0.2).max(0.1);
        }
        score.clamp(0.0, 1.0)
    }

    fn recompute_success_rate(&mut self) {
        let total = self.total_requests.max(1) as f64;
        let good = self.total_requests.saturating_sub(self.failures as u64) as f64;
        self.success_rate = (good / total).clamp(0.0, 1.0);
    }

    pub fn record_probe_success(&mut self, response_time: f64) {
        self.response_time = Some(response_time);
        self.last_checked = Some(Utc::now());
        self.total_requests += 1;
        self.failures = self.failures.saturating_sub(1);
        self.active = true;
        self.recompute_success_rate();
    }

    /// Returns true when this failure took the mirror out of rotation.
    pub fn record_probe_failure(&mut self) -> bool {
        self.last_checked = Some(Utc::now());
        self.failures += 1;
        self.total_requests += 1;
        self.recompute_success_rate();
        if self.active && self.failures >= PROBE_FAILURE_LIMIT {
            self.active = false;
            return true;
        }
        false
    }

    /// Feed back a transfer outcome. Returns true when the mirror got demoted.
    ///
    /// Latency is only updated by probes.
    pub fn record_transfer(&mut self, success: bool, bandwidth: f64) -> bool {
        if success {
            self.bandwidth = bandwidth;
        }
        self.last_checked = Some(Utc::now());
        self.total_requests += 1;
        if success {
            self.failures = self.failures.saturating_sub(1);
        } else {
            self.failures += 1;
        }
        self.recompute_success_rate();

        if self.active
            && self.failures >= TRANSFER_FAILURE_LIMIT
            && self.success_rate < TRANSFER_SUCCESS_FLOOR
        {
            self.active = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror(priority: u32, rt: f64, sr: f64) -> Mirror {
        let mut m = Mirror::new("https://m.example.com", "m", "eu", priority);
        m.response_time = Some(rt);
        m.success_rate = sr;
        m
    }

    #[test]
    fn test_score_ordering() {
        let slow = mirror(1, 0.5, 0.9);
        let fast = mirror(1, 0.1, 0.99);
        assert!(fast.score() < slow.score());

        // Priority outweighs a small latency edge
        let preferred = mirror(1, 0.2, 1.0);
        let secondary = mirror(2, 0.1, 1.0);
        assert!(preferred.score() < secondary.score());
    }

    #[test]
    fn test_unprobed_mirror_scores_last() {
        let unprobed = Mirror::new("https://a.example.com", "a", "eu", 1);
        let probed = mirror(5, 2.0, 0.5);
        assert!(probed.score() < unprobed.score());
    }

    #[test]
    fn test_probe_failures_deactivate() {
        let mut m = Mirror::new("https://a.example.com", "a", "eu", 1);
        assert!(!m.record_probe_failure());
        assert!(!m.record_probe_failure());
        assert!(m.record_probe_failure());
        assert!(!m.active);
        assert_eq!(m.total_requests, 3);

        // A fresh successful probe brings it back
        m.record_probe_success(0.2);
        assert!(m.active);
        assert_eq!(m.failures, 2);
        assert!((m.success_rate - 2.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_transfer_demotion_needs_low_success_rate() {
        let mut m = Mirror::new("https://a.example.com", "a", "eu", 1);
        for _ in 0..20 {
            m.record_transfer(true, 5.0);
        }
        for _ in 0..5 {
            assert!(!m.record_transfer(false, 0.0));
        }
        assert!(m.active, "high success rate keeps the mirror");

        let mut flaky = Mirror::new("https://b.example.com", "b", "eu", 1);
        let mut demoted = false;
        for _ in 0..5 {
            demoted |= flaky.record_transfer(false, 0.0);
        }
        assert!(demoted);
        assert!(!flaky.active);
    }

    #[test]
    fn test_health_score() {
        let healthy = mirror(1, 0.1, 1.0);
        assert!((healthy.health_score() - 1.0).abs() < 1e-9);

        let mut struggling = mirror(1, 3.0, 0.5);
        struggling.failures = 2;
        assert!(struggling.health_score() < 0.2);
    }
}
