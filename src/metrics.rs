use crate::volatility::VolatilityEstimate;
use serde::{Deserialize, Serialize};

/// Number of outcomes in the loss tail: `floor((1 − c)·N)`.
pub fn tail_size(num_outcomes: usize, confidence_level: f64) -> usize {
    ((1.0 - confidence_level) * num_outcomes as f64).floor() as usize
}

fn sorted(outcomes: &[f64]) -> Vec<f64> {
    let mut sorted = outcomes.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Loss at the `k`-th worst outcome, floored at zero.
pub fn value_at_risk(outcomes: &[f64], initial_value: f64, confidence_level: f64) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let sorted = sorted(outcomes);
    let k = tail_size(sorted.len(), confidence_level).min(sorted.len() - 1);
    (initial_value - sorted[k]).max(0.0)
}

/// Mean loss over the `k` worst outcomes, floored at zero; zero for an empty tail.
pub fn conditional_value_at_risk(outcomes: &[f64], initial_value: f64, confidence_level: f64) -> f64 {
    let k = tail_size(outcomes.len(), confidence_level).min(outcomes.len());
    if k == 0 {
        return 0.0;
    }
    let sorted = sorted(outcomes);
    let tail_mean = sorted[..k].iter().sum::<f64>() / k as f64;
    (initial_value - tail_mean).max(0.0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedAsset {
    pub asset: String,
    pub volatility: f64,
}

/// Most volatile first; equal volatilities ordered by asset id.
pub fn risk_ranking(estimates: &[VolatilityEstimate]) -> Vec<RankedAsset> {
    let mut ranking: Vec<RankedAsset> = estimates
        .iter()
        .map(|v| RankedAsset {
            asset: v.asset.clone(),
            volatility: v.sigma,
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.volatility
            .total_cmp(&a.volatility)
            .then_with(|| a.asset.cmp(&b.asset))
    });
    ranking
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestions {
    pub increase: Vec<String>,
    pub decrease: Vec<String>,
}

/// Raise the least volatile holding; trim the most volatile one when there are two or more.
pub fn suggestions(ranking: &[RankedAsset]) -> Suggestions {
    let mut out = Suggestions::default();
    if let Some(least) = ranking.last() {
        out.increase.push(least.asset.clone());
    }
    if ranking.len() > 1 {
        out.decrease.push(ranking[0].asset.clone());
    }
    out
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub confidence_level: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
    pub tail_size: usize,
    pub ranking: Vec<RankedAsset>,
    pub suggestions: Suggestions,
}

impl RiskMetrics {
    pub fn compute(
        outcomes: &[f64],
        initial_value: f64,
        confidence_level: f64,
        volatilities: &[VolatilityEstimate],
    ) -> Self {
        let ranking = risk_ranking(volatilities);
        let suggestions = suggestions(&ranking);
        Self {
            confidence_level,
            value_at_risk: value_at_risk(outcomes, initial_value, confidence_level),
            conditional_value_at_risk: conditional_value_at_risk(outcomes, initial_value, confidence_level),
            tail_size: tail_size(outcomes.len(), confidence_level),
            ranking,
            suggestions,
        }
    }
}
