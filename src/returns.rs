use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Chronological direction of a supplied price sequence.
///
/// The market-data source decides this; the pipeline never infers it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesOrder {
    OldestFirst,
    NewestFirst,
}

/// Daily prices of one asset, in TL.
///
/// Non-finite or non-positive entries are kept in place and treated as missing days.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub asset: String,
    pub prices: Vec<f64>,
    pub order: SeriesOrder,
}

impl PriceSeries {
    pub fn new(asset: impl Into<String>, prices: Vec<f64>, order: SeriesOrder) -> Self {
        Self {
            asset: asset.into(),
            prices,
            order,
        }
    }

    /// Prices oldest-first regardless of how they were supplied.
    pub fn chronological(&self) -> Vec<f64> {
        match self.order {
            SeriesOrder::OldestFirst => self.prices.clone(),
            SeriesOrder::NewestFirst => self.prices.iter().rev().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// `r[i] = ln(p[i+1] / p[i])`, oldest first. `None` marks a day touching a missing price.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogReturnSeries {
    pub asset: String,
    pub values: Vec<Option<f64>>,
}

impl LogReturnSeries {
    /// Defined returns only, in order.
    pub fn observed(&self) -> Vec<f64> {
        self.values.iter().flatten().copied().collect()
    }

    pub fn observed_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drift: mean of the defined returns.
    pub fn drift(&self) -> Option<f64> {
        let observed = self.observed();
        if observed.is_empty() {
            None
        } else {
            Some(mean(&observed))
        }
    }
}

fn is_usable_price(p: f64) -> bool {
    p.is_finite() && p > 0.0
}

/// Log returns of a chronological price slice.
pub fn log_returns(prices: &[f64]) -> Vec<Option<f64>> {
    prices
        .windows(2)
        .map(|w| {
            if is_usable_price(w[0]) && is_usable_price(w[1]) {
                Some((w[1] / w[0]).ln())
            } else {
                None
            }
        })
        .collect()
}

/// Brings every history onto a common, chronological window.
///
/// Series shorter than two entries are dropped. The rest are cut to the shortest
/// remaining length, keeping the most recent days of each.
pub fn align_histories(histories: &[PriceSeries]) -> Vec<PriceSeries> {
    let candidates: Vec<&PriceSeries> = histories
        .iter()
        .filter(|s| {
            if s.len() < 2 {
                warn!(
                    "{}: price history unavailable or too short ({} points); excluded from analysis",
                    s.asset,
                    s.len()
                );
                false
            } else {
                true
            }
        })
        .collect();

    let Some(min_len) = candidates.iter().map(|s| s.len()).min() else {
        return Vec::new();
    };

    debug!("Aligning {} histories to {} days", candidates.len(), min_len);

    candidates
        .into_iter()
        .map(|s| {
            let chrono = s.chronological();
            let start = chrono.len() - min_len;
            PriceSeries::new(s.asset.clone(), chrono[start..].to_vec(), SeriesOrder::OldestFirst)
        })
        .collect()
}

/// Converts aligned histories into log-return series.
///
/// An asset without two consecutive usable prices is dropped with a warning.
pub fn compute_log_returns(aligned: &[PriceSeries]) -> Vec<LogReturnSeries> {
    aligned
        .iter()
        .filter_map(|series| {
            let values = log_returns(&series.chronological());
            if values.iter().all(Option::is_none) {
                warn!(
                    "{}: fewer than 2 usable consecutive prices; no log returns computed",
                    series.asset
                );
                return None;
            }
            Some(LogReturnSeries {
                asset: series.asset.clone(),
                values,
            })
        })
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with Bessel's correction; `NaN` below two observations.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss = values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    (ss / (values.len() as f64 - 1.0)).sqrt()
}

/// Maximum-likelihood (population) standard deviation.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let ss = values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    (ss / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_log_returns_length_and_values() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [2usize, 3, 10, 250] {
            let prices: Vec<f64> = (0..len).map(|_| rng.gen_range(1.0..100.0)).collect();
            let rets = log_returns(&prices);
            assert_eq!(rets.len(), len - 1);
            for i in 0..len - 1 {
                let expected = (prices[i + 1] / prices[i]).ln();
                assert_relative_eq!(rets[i].unwrap(), expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_missing_price_blanks_adjacent_returns() {
        let rets = log_returns(&[10.0, 11.0, f64::NAN, 12.0, 0.0, 13.0]);
        assert_eq!(rets.len(), 5);
        assert!(rets[0].is_some());
        assert!(rets[1].is_none());
        assert!(rets[2].is_none());
        assert!(rets[3].is_none());
        assert!(rets[4].is_none());
    }

    #[test]
    fn test_newest_first_series_is_reversed() {
        let s = PriceSeries::new("USD", vec![3.0, 2.0, 1.0], SeriesOrder::NewestFirst);
        assert_eq!(s.chronological(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_alignment_keeps_most_recent_common_window() {
        let histories = vec![
            PriceSeries::new("USD", vec![1.0, 2.0, 3.0, 4.0, 5.0], SeriesOrder::OldestFirst),
            PriceSeries::new("EUR", vec![30.0, 20.0, 10.0], SeriesOrder::NewestFirst),
            PriceSeries::new("Gold_Gram_TL", vec![], SeriesOrder::OldestFirst),
        ];
        let aligned = align_histories(&histories);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].prices, vec![3.0, 4.0, 5.0]);
        assert_eq!(aligned[1].prices, vec![10.0, 20.0, 30.0]);
        assert!(aligned.iter().all(|s| s.order == SeriesOrder::OldestFirst));
    }

    #[test]
    fn test_alignment_of_nothing_is_empty() {
        let histories = vec![PriceSeries::new("USD", vec![1.0], SeriesOrder::OldestFirst)];
        assert!(align_histories(&histories).is_empty());
    }

    #[test]
    fn test_asset_without_usable_pairs_is_dropped() {
        let aligned = vec![
            PriceSeries::new("USD", vec![1.0, 1.1, 1.2], SeriesOrder::OldestFirst),
            PriceSeries::new("EUR", vec![1.0, -1.0, 1.2], SeriesOrder::OldestFirst),
        ];
        let rets = compute_log_returns(&aligned);
        assert_eq!(rets.len(), 1);
        assert_eq!(rets[0].asset, "USD");
        assert_eq!(rets[0].len(), 2);
    }

    #[test]
    fn test_drift_and_dispersion_helpers() {
        let series = LogReturnSeries {
            asset: "USD".into(),
            values: vec![Some(0.01), None, Some(0.03)],
        };
        assert_relative_eq!(series.drift().unwrap(), 0.02, epsilon = 1e-15);
        assert_eq!(series.observed_count(), 2);
        assert_relative_eq!(sample_std_dev(&[1.0, 2.0, 3.0, 4.0]), 1.2909944487358056, epsilon = 1e-12);
        assert_relative_eq!(population_std_dev(&[1.0, 2.0, 3.0, 4.0]), 1.118033988749895, epsilon = 1e-12);
        assert!(sample_std_dev(&[1.0]).is_nan());
    }
}
