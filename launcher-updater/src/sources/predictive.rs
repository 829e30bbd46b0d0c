//! Short rolling history per source, used to predict the next request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

const HISTORY_CAP: usize = 200;
const HISTORY_KEEP: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LoadSample {
    pub timestamp: DateTime<Utc>,
    /// Seconds
    pub response_time: f64,
    pub success: bool,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadTrend {
    Increasing,
    Stable,
    Decreasing,
}

impl LoadTrend {
    fn factor(self) -> f64 {
        match self {
            LoadTrend::Increasing => 0.8,
            LoadTrend::Stable => 1.0,
            LoadTrend::Decreasing => 1.2,
        }
    }
}

#[derive(Debug, Default)]
pub struct PredictiveModel {
    patterns: HashMap<String, Vec<LoadSample>>,
}

impl PredictiveModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, source: &str, response_time: f64, success: bool, bytes: u64) {
        let history = self.patterns.entry(source.to_string()).or_default();
        history.push(LoadSample {
            timestamp: Utc::now(),
            response_time,
            success,
            bytes,
        });
        if history.len() > HISTORY_CAP {
            history.drain(..history.len() - HISTORY_KEEP);
        }
    }

    fn recent(&self, source: &str, count: usize) -> &[LoadSample] {
        match self.patterns.get(source) {
            Some(history) => &history[history.len().saturating_sub(count)..],
            None => &[],
        }
    }

    /// Mean latency of recent successful requests.
    pub fn predict_response_time(&self, source: &str) -> f64 {
        let recent = self.recent(source, 10);
        if recent.is_empty() {
            return 1.0;
        }
        let ok: Vec<f64> = recent.iter().filter(|s| s.success).map(|s| s.response_time).collect();
        if ok.is_empty() {
            return 5.0;
        }
        ok.iter().sum::<f64>() / ok.len() as f64
    }

    pub fn predict_success_probability(&self, source: &str) -> f64 {
        let recent = self.recent(source, 20);
        if recent.is_empty() {
            return 0.8;
        }
        recent.iter().filter(|s| s.success).count() as f64 / recent.len() as f64
    }

    /// Compare the latency of the older and newer half of the last ten samples.
    pub fn load_trend(&self, source: &str) -> LoadTrend {
        let recent = self.recent(source, 10);
        if recent.len() < 5 {
            return LoadTrend::Stable;
        }
        let (first, second) = recent.split_at(recent.len() / 2);
        let mean = |s: &[LoadSample]| s.iter().map(|x| x.response_time).sum::<f64>() / s.len() as f64;
        let (before, after) = (mean(first), mean(second));

        if after > before * 1.2 {
            LoadTrend::Increasing
        } else if after < before * 0.8 {
            LoadTrend::Decreasing
        } else {
            LoadTrend::Stable
        }
    }

    /// Higher is better.
    pub fn score(&self, source: &str, health: f64) -> f64 {
        let rt = self.predict_response_time(source);
        let success = self.predict_success_probability(source);
        success * 0.4 + (1.0 / rt.max(0.1)) * 0.3 + health * 0.2 + self.load_trend(source).factor() * 0.1
    }

    pub fn sample_count(&self, source: &str) -> usize {
        self.patterns.get(source).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_history() {
        let model = PredictiveModel::new();
        assert_eq!(model.predict_response_time("a"), 1.0);
        assert_eq!(model.predict_success_probability("a"), 0.8);
        assert_eq!(model.load_trend("a"), LoadTrend::Stable);
    }

    #[test]
    fn test_failures_predict_slow() {
        let mut model = PredictiveModel::new();
        for _ in 0..3 {
            model.add_sample("a", 0.2, false, 0);
        }
        assert_eq!(model.predict_response_time("a"), 5.0);
        assert_eq!(model.predict_success_probability("a"), 0.0);
    }

    #[test]
    fn test_trend_detection() {
        let mut model = PredictiveModel::new();
        for rt in [0.1, 0.1, 0.1, 0.1, 0.1, 0.5, 0.5, 0.5, 0.5, 0.5] {
            model.add_sample("slowing", rt, true, 0);
        }
        assert_eq!(model.load_trend("slowing"), LoadTrend::Increasing);

        for rt in [1.0, 1.0, 1.0, 0.2, 0.2, 0.2] {
            model.add_sample("recovering", rt, true, 0);
        }
        assert_eq!(model.load_trend("recovering"), LoadTrend::Decreasing);
    }

    #[test]
    fn test_history_trimmed() {
        let mut model = PredictiveModel::new();
        for _ in 0..201 {
            model.add_sample("a", 0.1, true, 0);
        }
        assert_eq!(model.sample_count("a"), HISTORY_KEEP);
    }

    #[test]
    fn test_score_prefers_fast_reliable() {
        let mut model = PredictiveModel::new();
        for _ in 0..10 {
            model.add_sample("fast", 0.1, true, 0);
            model.add_sample("slow", 2.0, true, 0);
        }
        assert!(model.score("fast", 1.0) > model.score("slow", 1.0));
    }
}
