//! Mirror selection strategies.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::mirror::Mirror;
use super::predictive::PredictiveModel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Lowest combined priority/latency/reliability score
    #[default]
    #[serde(alias = "best")]
    BestScore,
    RoundRobin,
    LeastConnections,
    /// Random pick weighted by inverse latency
    WeightedRandom,
    /// Healthiest mirror in the client's region, else healthiest overall
    Geographic,
    /// Rolling-history prediction of latency, success and load trend
    Predictive,
}

/// Mutable selection state carried between picks
#[derive(Debug, Default)]
pub struct StrategyState {
    round_robin_index: usize,
}

/// Index into `candidates` of the mirror to use. `candidates` must be non-empty.
pub fn pick(
    kind: StrategyKind,
    candidates: &[&Mirror],
    state: &mut StrategyState,
    model: &PredictiveModel,
    region: Option<&str>,
) -> usize {
    match kind {
        StrategyKind::BestScore => best_score(candidates),
        StrategyKind::RoundRobin => {
            let index = state.round_robin_index % candidates.len();
            state.round_robin_index = state.round_robin_index.wrapping_add(1);
            index
        }
        StrategyKind::LeastConnections => candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.active_connections
                    .cmp(&b.active_connections)
                    .then(a.score().total_cmp(&b.score()))
            })
            .map(|(i, _)| i)
            .unwrap_or(0),
        StrategyKind::WeightedRandom => weighted_random(candidates),
        StrategyKind::Geographic => {
            let local: Vec<usize> = match region {
                Some(region) => candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.region.eq_ignore_ascii_case(region))
                    .map(|(i, _)| i)
                    .collect(),
                None => Vec::new(),
            };
            let pool: Vec<usize> = if local.is_empty() {
                (0..candidates.len()).collect()
            } else {
                local
            };
            pool.into_iter()
                .max_by(|a, b| {
                    candidates[*a]
                        .health_score()
                        .total_cmp(&candidates[*b].health_score())
                        // Prefer the earlier (higher priority) mirror on ties
                        .then(b.cmp(a))
                })
                .unwrap_or(0)
        }
        StrategyKind::Predictive => candidates
            .iter()
            .enumerate()
            .map(|(i, m)| (i, model.score(&m.url, m.health_score())))
            .max_by(|(ia, a), (ib, b)| a.total_cmp(b).then(ib.cmp(ia)))
            .map(|(i, _)| i)
            .unwrap_or(0),
    }
}

fn best_score(candidates: &[&Mirror]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.score().total_cmp(&b.score()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn weighted_random(candidates: &[&Mirror]) -> usize {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|m| match m.response_time {
            Some(rt) if rt > 0.0 => 1.0 / rt * m.success_rate,
            _ => m.success_rate,
        })
        .collect();
    let total: f64 = weights.iter().sum();

    let mut rng = rand::thread_rng();
    if total <= 0.0 || !total.is_finite() {
        return rng.gen_range(0..candidates.len());
    }

    let target = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if target < cumulative {
            return i;
        }
    }
    candidates.len() - 1
}
