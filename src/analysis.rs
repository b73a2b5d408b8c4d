use crate::config::RiskConfig;
use crate::correlation::{correlation_matrix, factorize, CorrelationMatrix, FactorMode};
use crate::distribution::{fit_all, FittedDistribution};
use crate::error::RiskError;
use crate::market::PriceHistorySource;
use crate::metrics::{RankedAsset, RiskMetrics, Suggestions};
use crate::returns::{align_histories, compute_log_returns, PriceSeries, SeriesOrder};
use crate::simulation::{AssetModel, CancellationToken, MonteCarloSimulator};
use crate::volatility::{estimate_volatilities, estimator_for, VolatilityEstimator, VolatilitySource};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetDiagnostics {
    pub asset: String,
    pub initial_value: f64,
    pub drift: f64,
    pub volatility: f64,
    pub observed_returns: usize,
    pub distribution: Option<FittedDistribution>,
}

/// How a report was produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub factor_mode: FactorMode,
    pub volatility_source: VolatilitySource,
    pub aligned_observations: usize,
    pub assets: Vec<AssetDiagnostics>,
    /// Wallet assets without usable history, held at their current value.
    pub unmodelled_assets: Vec<String>,
    pub correlation: CorrelationMatrix,
    pub seed: u64,
    pub num_simulations: usize,
    pub num_days: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub initial_value: f64,
    pub confidence_level: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
    /// Outcomes averaged into the CVaR; zero means the tail is empty and the CVaR is undefined.
    pub tail_size: usize,
    pub risk_ranking: Vec<RankedAsset>,
    pub suggestions: Suggestions,
    pub diagnostics: Diagnostics,
    pub generated_at: DateTime<Utc>,
}

/// Runs the pipeline with the volatility model named in `config`.
pub fn analyze(
    initial_values: &BTreeMap<String, f64>,
    histories: &[PriceSeries],
    config: &RiskConfig,
) -> Result<RiskReport, RiskError> {
    let estimator = estimator_for(config.volatility_model);
    run_analysis(
        initial_values,
        histories,
        config,
        estimator.as_ref(),
        &CancellationToken::new(),
    )
}

/// Runs the full pipeline on already-fetched histories.
///
/// `initial_values` maps each wallet asset to its current TL value. Histories for
/// assets outside the wallet are ignored; wallet assets with no history are
/// treated as unavailable.
pub fn run_analysis(
    initial_values: &BTreeMap<String, f64>,
    histories: &[PriceSeries],
    config: &RiskConfig,
    estimator: &dyn VolatilityEstimator,
    cancel: &CancellationToken,
) -> Result<RiskReport, RiskError> {
    config.validate()?;

    if initial_values.is_empty() {
        return Err(RiskError::config(
            "Wallet holds no USD, EUR or gold to analyse",
        ));
    }
    if let Some((asset, value)) = initial_values.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
        return Err(RiskError::config(format!(
            "Wallet value for {} must be a non-negative number, got {}",
            asset, value
        )));
    }
    let held: BTreeMap<String, f64> = initial_values
        .iter()
        .filter(|(asset, value)| {
            if **value == 0.0 {
                warn!("{}: zero holding dropped from analysis", asset);
            }
            **value > 0.0
        })
        .map(|(asset, value)| (asset.clone(), *value))
        .collect();
    if held.is_empty() {
        return Err(RiskError::config(
            "Portfolio value must be positive for risk analysis",
        ));
    }
    let initial_values = &held;
    let initial_value: f64 = initial_values.values().sum();
    if !(initial_value > 0.0 && initial_value.is_finite()) {
        return Err(RiskError::config(
            "Portfolio value must be positive for risk analysis",
        ));
    }

    // Returns
    let wallet_histories: Vec<PriceSeries> = initial_values
        .keys()
        .map(|asset| {
            histories
                .iter()
                .find(|h| &h.asset == asset)
                .cloned()
                .unwrap_or_else(|| PriceSeries::new(asset.clone(), Vec::new(), SeriesOrder::OldestFirst))
        })
        .collect();
    let aligned = align_histories(&wallet_histories);
    if aligned.is_empty() {
        let missing: Vec<&str> = initial_values.keys().map(String::as_str).collect();
        return Err(RiskError::data(format!(
            "No usable price history for wallet assets {:?}; check the market data source",
            missing
        )));
    }
    let aligned_observations = aligned[0].len();
    let returns = compute_log_returns(&aligned);
    if returns.is_empty() {
        return Err(RiskError::data("Log returns could not be computed for any wallet asset"));
    }

    let unmodelled_assets: Vec<String> = initial_values
        .keys()
        .filter(|asset| !returns.iter().any(|r| &r.asset == *asset))
        .cloned()
        .collect();
    if !unmodelled_assets.is_empty() {
        warn!(
            "Assets without usable history are held at current value: {:?}",
            unmodelled_assets
        );
    }

    // Distributions
    let fitted = fit_all(&returns, &config.families, config.histogram_bins);

    // Drift
    let drifts: Vec<f64> = returns.iter().map(|r| r.drift().unwrap_or(0.0)).collect();
    if drifts.iter().all(|&d| d == 0.0) {
        return Err(RiskError::numeric("Drift could not be computed for risk analysis"));
    }

    // Volatility
    let volatilities = estimate_volatilities(&returns, estimator)?;
    let sigmas: Vec<f64> = volatilities.iter().map(|v| v.sigma).collect();

    // Correlation
    let correlation = correlation_matrix(&returns);
    let factor = factorize(&correlation, &sigmas);
    if factor.dim() == 0 {
        return Err(RiskError::numeric(
            "Covariance/correlation matrix could not be computed for risk analysis",
        ));
    }

    // Simulation
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
    let models: Vec<AssetModel> = returns
        .iter()
        .zip(&drifts)
        .zip(&sigmas)
        .zip(&fitted)
        .map(|(((r, &drift), &sigma), fit)| AssetModel {
            asset: r.asset.clone(),
            value: initial_values.get(&r.asset).copied().unwrap_or(0.0),
            drift,
            sigma,
            distribution: fit.as_ref().map(|f| f.params),
        })
        .collect();
    let simulator = MonteCarloSimulator::new(config.num_simulations, config.num_days, seed)
        .with_cancellation(cancel.clone());
    let mut outcome = simulator
        .run(&models, &factor)
        .map_err(|e| RiskError::numeric(format!("Monte Carlo simulation produced no results: {}", e)))?;
    if outcome.is_empty() {
        return Err(RiskError::numeric("Monte Carlo simulation produced no results"));
    }
    let held_value: f64 = unmodelled_assets
        .iter()
        .filter_map(|a| initial_values.get(a))
        .sum();
    if held_value != 0.0 {
        outcome.terminal_values.iter_mut().for_each(|v| *v += held_value);
    }

    // Metrics
    let metrics = RiskMetrics::compute(
        &outcome.terminal_values,
        initial_value,
        config.confidence_level,
        &volatilities,
    );
    info!(
        "VaR {:.0}% = {:.2} TL, CVaR = {:.2} TL on {:.2} TL ({} trials, {:?} factor)",
        config.confidence_level * 100.0,
        metrics.value_at_risk,
        metrics.conditional_value_at_risk,
        initial_value,
        outcome.len(),
        factor.mode
    );

    let assets = models
        .iter()
        .zip(&returns)
        .zip(fitted)
        .map(|((m, r), distribution)| AssetDiagnostics {
            asset: m.asset.clone(),
            initial_value: m.value,
            drift: m.drift,
            volatility: m.sigma,
            observed_returns: r.observed_count(),
            distribution,
        })
        .collect();

    Ok(RiskReport {
        initial_value,
        confidence_level: metrics.confidence_level,
        value_at_risk: metrics.value_at_risk,
        conditional_value_at_risk: metrics.conditional_value_at_risk,
        tail_size: metrics.tail_size,
        risk_ranking: metrics.ranking,
        suggestions: metrics.suggestions,
        diagnostics: Diagnostics {
            factor_mode: factor.mode,
            volatility_source: volatilities
                .first()
                .map_or(estimator.source(), |v| v.source),
            aligned_observations,
            assets,
            unmodelled_assets,
            correlation,
            seed,
            num_simulations: config.num_simulations,
            num_days: config.num_days,
        },
        generated_at: Utc::now(),
    })
}

/// Fetches histories for the wallet assets from `source`, then runs the pipeline on
/// the blocking pool.
pub async fn run_with_source<S: PriceHistorySource>(
    source: &S,
    initial_values: BTreeMap<String, f64>,
    config: RiskConfig,
    estimator: Box<dyn VolatilityEstimator>,
    cancel: CancellationToken,
) -> Result<RiskReport, RiskError> {
    config.validate()?;
    let assets: Vec<String> = initial_values
        .iter()
        .filter(|(_, value)| **value > 0.0)
        .map(|(asset, _)| asset.clone())
        .collect();
    if assets.is_empty() {
        return Err(RiskError::config("Wallet holds no USD, EUR or gold to analyse"));
    }
    info!("Fetching price history for {:?} from {}", assets, source.name());
    let histories = source
        .fetch_histories(&assets)
        .await
        .map_err(|e| RiskError::data(format!("Market data required for risk analysis could not be fetched: {:#}", e)))?;

    tokio::task::spawn_blocking(move || {
        run_analysis(&initial_values, &histories, &config, estimator.as_ref(), &cancel)
    })
    .await
    .map_err(|e| RiskError::numeric(format!("Risk analysis task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolatilityModel;
    use crate::market::JsonFileSource;
    use crate::volatility::SampleStdDevEstimator;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};
    use std::io::Write;

    fn wallet(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Oldest-first random walk with a small upward drift.
    fn walk(asset: &str, start: f64, sigma: f64, days: usize, seed: u64) -> PriceSeries {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price = start;
        let mut prices = vec![price];
        for _ in 1..days {
            let z: f64 = StandardNormal.sample(&mut rng);
            price *= (0.0005 + sigma * z).exp();
            prices.push(price);
        }
        PriceSeries::new(asset, prices, SeriesOrder::OldestFirst)
    }

    fn fast_config() -> RiskConfig {
        RiskConfig {
            num_simulations: 2_000,
            seed: Some(99),
            volatility_model: VolatilityModel::Sample,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn test_empty_wallet_is_rejected() {
        let err = analyze(&BTreeMap::new(), &[], &RiskConfig::default()).unwrap_err();
        assert!(matches!(err, RiskError::Config(_)));
    }

    #[test]
    fn test_zero_value_wallet_is_rejected() {
        let err = analyze(&wallet(&[("USD", 0.0)]), &[], &RiskConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_negative_holding_is_rejected() {
        let histories = vec![walk("USD", 34.0, 0.004, 60, 10), walk("EUR", 37.0, 0.006, 60, 11)];
        let values = wallet(&[("USD", 2_000.0), ("EUR", -500.0)]);
        let err = analyze(&values, &histories, &fast_config()).unwrap_err();
        assert!(matches!(err, RiskError::Config(_)));
        assert!(err.to_string().contains("EUR"));

        let nan = wallet(&[("USD", 2_000.0), ("EUR", f64::NAN)]);
        assert!(matches!(analyze(&nan, &histories, &fast_config()), Err(RiskError::Config(_))));
    }

    #[test]
    fn test_zero_holding_is_not_modelled_or_ranked() {
        let histories = vec![walk("USD", 34.0, 0.004, 60, 12), walk("EUR", 37.0, 0.009, 60, 13)];
        let values = wallet(&[("USD", 1_000.0), ("EUR", 0.0)]);
        let report = analyze(&values, &histories, &fast_config()).unwrap();
        assert_eq!(report.initial_value, 1_000.0);
        assert_eq!(report.risk_ranking.len(), 1);
        assert_eq!(report.risk_ranking[0].asset, "USD");
        assert!(report.suggestions.decrease.is_empty());
        assert_eq!(report.suggestions.increase, vec!["USD".to_string()]);
        assert!(report.diagnostics.assets.iter().all(|a| a.asset != "EUR"));
        assert!(report.diagnostics.unmodelled_assets.is_empty());
    }

    #[test]
    fn test_small_run_reports_empty_tail() {
        let histories = vec![walk("USD", 34.0, 0.004, 60, 14)];
        let config = RiskConfig {
            num_simulations: 10,
            ..fast_config()
        };
        let report = analyze(&wallet(&[("USD", 1_000.0)]), &histories, &config).unwrap();
        assert_eq!(report.tail_size, 0);
        assert_eq!(report.conditional_value_at_risk, 0.0);

        let report = analyze(&wallet(&[("USD", 1_000.0)]), &histories, &fast_config()).unwrap();
        assert_eq!(report.tail_size, 100);
        assert!(report.conditional_value_at_risk >= report.value_at_risk);
    }

    #[test]
    fn test_invalid_confidence_is_rejected_before_work() {
        let config = RiskConfig {
            confidence_level: 1.2,
            ..RiskConfig::default()
        };
        let err = analyze(&wallet(&[("USD", 1000.0)]), &[], &config).unwrap_err();
        assert!(matches!(err, RiskError::Config(_)));
    }

    #[test]
    fn test_missing_history_is_a_data_error() {
        let histories = vec![PriceSeries::new("USD", vec![34.0], SeriesOrder::OldestFirst)];
        let err = analyze(&wallet(&[("USD", 1000.0)]), &histories, &fast_config()).unwrap_err();
        assert!(matches!(err, RiskError::Data(_)));
    }

    #[test]
    fn test_flat_prices_have_no_drift() {
        let histories = vec![PriceSeries::new("USD", vec![34.0; 50], SeriesOrder::OldestFirst)];
        let err = analyze(&wallet(&[("USD", 1000.0)]), &histories, &fast_config()).unwrap_err();
        assert!(matches!(err, RiskError::Numeric(_)));
    }

    #[test]
    fn test_three_asset_report() {
        let histories = vec![
            walk("USD", 34.0, 0.004, 120, 1),
            walk("EUR", 37.0, 0.006, 120, 2),
            walk("Gold_Gram_TL", 2500.0, 0.012, 120, 3),
        ];
        let values = wallet(&[("USD", 10_000.0), ("EUR", 5_000.0), ("Gold_Gram_TL", 20_000.0)]);
        let report = analyze(&values, &histories, &fast_config()).unwrap();

        assert_eq!(report.initial_value, 35_000.0);
        assert!(report.value_at_risk >= 0.0);
        assert!(report.conditional_value_at_risk >= report.value_at_risk);
        assert_eq!(report.risk_ranking.len(), 3);
        assert_eq!(report.risk_ranking[0].asset, "Gold_Gram_TL");
        assert_eq!(report.suggestions.decrease, vec!["Gold_Gram_TL".to_string()]);
        assert_eq!(report.suggestions.increase, vec!["USD".to_string()]);
        assert_eq!(report.diagnostics.seed, 99);
        assert_eq!(report.diagnostics.aligned_observations, 120);
        assert_eq!(report.diagnostics.volatility_source, VolatilitySource::SampleStddev);
        assert!(report.diagnostics.unmodelled_assets.is_empty());
        assert!(report.diagnostics.assets.iter().all(|a| a.observed_returns == 119));

        let again = analyze(&values, &histories, &fast_config()).unwrap();
        assert_eq!(again.value_at_risk, report.value_at_risk);
        assert_eq!(again.conditional_value_at_risk, report.conditional_value_at_risk);
    }

    #[test]
    fn test_asset_without_history_is_held_constant() {
        let histories = vec![walk("USD", 34.0, 0.004, 60, 4)];
        let values = wallet(&[("USD", 1_000.0), ("EUR", 500.0)]);
        let report = analyze(&values, &histories, &fast_config()).unwrap();
        assert_eq!(report.initial_value, 1_500.0);
        assert_eq!(report.diagnostics.unmodelled_assets, vec!["EUR".to_string()]);
        assert_eq!(report.risk_ranking.len(), 1);
        // Only the USD leg moves, so losses are bounded by its value.
        assert!(report.conditional_value_at_risk <= 1_000.0);
    }

    #[test]
    fn test_cancelled_run_surfaces_numeric_error() {
        let histories = vec![walk("USD", 34.0, 0.004, 60, 5)];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_analysis(
            &wallet(&[("USD", 1_000.0)]),
            &histories,
            &fast_config(),
            &SampleStdDevEstimator,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, RiskError::Numeric(_)));
    }

    #[tokio::test]
    async fn test_run_with_file_source() {
        let usd = walk("USD", 34.0, 0.004, 80, 6);
        let eur = walk("EUR", 37.0, 0.007, 80, 7);
        let newest_first = |s: &PriceSeries| s.prices.iter().rev().copied().collect::<Vec<f64>>();
        let body = serde_json::json!({
            "order": "newest_first",
            "series": { "USD": newest_first(&usd), "EUR": newest_first(&eur) }
        });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", body).unwrap();

        let report = run_with_source(
            &JsonFileSource::new(file.path()),
            wallet(&[("USD", 2_000.0), ("EUR", 2_000.0)]),
            fast_config(),
            Box::new(SampleStdDevEstimator),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.risk_ranking[0].asset, "EUR");
        assert_eq!(report.diagnostics.aligned_observations, 80);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["value_at_risk"].is_number());
        assert_eq!(json["diagnostics"]["volatility_source"], "sample_stddev");
    }

    #[tokio::test]
    async fn test_unreadable_source_is_a_data_error() {
        let err = run_with_source(
            &JsonFileSource::new("/nonexistent/history.json"),
            wallet(&[("USD", 1_000.0)]),
            fast_config(),
            Box::new(SampleStdDevEstimator),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RiskError::Data(_)));
    }
}
