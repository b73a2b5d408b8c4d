use crate::config::{VolatilityModel, GARCH_MIN_OBSERVATIONS};
use crate::error::{RiskError, VolatilityFitError};
use crate::returns::{sample_std_dev, LogReturnSeries};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;
use tracing::{debug, info, warn};

/// Floor applied to conditional variances inside the likelihood.
const MIN_VARIANCE: f64 = 1e-20;
/// α + β must stay strictly below this for covariance stationarity.
const MAX_PERSISTENCE: f64 = 0.999;
const MIN_NU: f64 = 2.1;
const MAX_NU: f64 = 100.0;
const REFINE_ITERATIONS: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilitySource {
    Conditional,
    SampleStddev,
}

impl VolatilitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conditional => "conditional",
            Self::SampleStddev => "sample_stddev",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolatilityEstimate {
    pub asset: String,
    pub sigma: f64,
    pub source: VolatilitySource,
}

/// A per-asset volatility strategy, chosen once by the caller.
pub trait VolatilityEstimator: Send + Sync {
    fn source(&self) -> VolatilitySource;

    /// σ of one return series (missing days already removed).
    fn estimate(&self, returns: &[f64]) -> Result<f64, VolatilityFitError>;

    fn is_conditional(&self) -> bool {
        self.source() == VolatilitySource::Conditional
    }
}

/// Strategy matching a configured model name.
pub fn estimator_for(model: VolatilityModel) -> Box<dyn VolatilityEstimator> {
    match model {
        VolatilityModel::Garch => Box::new(ConditionalVolatilityEstimator::default()),
        VolatilityModel::Sample => Box::new(SampleStdDevEstimator),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SampleStdDevEstimator;

impl VolatilityEstimator for SampleStdDevEstimator {
    fn source(&self) -> VolatilitySource {
        VolatilitySource::SampleStddev
    }

    fn estimate(&self, returns: &[f64]) -> Result<f64, VolatilityFitError> {
        if returns.len() < 2 {
            return Err(VolatilityFitError::InsufficientData {
                needed: 2,
                got: returns.len(),
            });
        }
        Ok(sample_std_dev(returns))
    }
}

/// Innovation law of the GARCH likelihood.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Innovations {
    StudentT,
    Normal,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct GarchParams {
    omega: f64,
    alpha: f64,
    beta: f64,
    /// Degrees of freedom; only used with Student-t innovations.
    nu: f64,
}

impl GarchParams {
    fn is_admissible(&self) -> bool {
        self.omega > 0.0
            && self.alpha >= 0.0
            && self.beta >= 0.0
            && self.alpha + self.beta < MAX_PERSISTENCE
            && self.nu > 2.0
    }
}

/// Result of a GARCH(1,1) fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GarchFit {
    pub omega: f64,
    pub alpha: f64,
    pub beta: f64,
    pub nu: Option<f64>,
    pub innovations: Innovations,
    pub log_likelihood: f64,
    /// In-sample conditional volatility of the most recent observation.
    pub last_volatility: f64,
}

/// Conditional variance path `h[t] = ω + α·r[t-1]² + β·h[t-1]`, seeded with the sample variance.
fn conditional_variance(returns: &[f64], params: &GarchParams, initial: f64) -> Vec<f64> {
    let mut variance = Vec::with_capacity(returns.len());
    variance.push(initial);
    for t in 1..returns.len() {
        let h = params.omega + params.alpha * returns[t - 1].powi(2) + params.beta * variance[t - 1];
        variance.push(h);
    }
    variance
}

fn log_likelihood(returns: &[f64], variance: &[f64], params: &GarchParams, innovations: Innovations) -> f64 {
    match innovations {
        Innovations::Normal => returns
            .iter()
            .zip(variance)
            .map(|(&r, &h)| {
                let h = h.max(MIN_VARIANCE);
                -0.5 * ((2.0 * PI).ln() + h.ln() + r * r / h)
            })
            .sum(),
        Innovations::StudentT => {
            let nu = params.nu;
            let norm = ln_gamma((nu + 1.0) * 0.5) - ln_gamma(nu * 0.5) - 0.5 * (PI * (nu - 2.0)).ln();
            returns
                .iter()
                .zip(variance)
                .map(|(&r, &h)| {
                    let h = h.max(MIN_VARIANCE);
                    norm - 0.5 * h.ln() - 0.5 * (nu + 1.0) * (1.0 + r * r / (h * (nu - 2.0))).ln()
                })
                .sum()
        }
    }
}

/// Fits a zero-mean GARCH(1,1) by grid search followed by coordinate perturbation.
pub fn fit_garch(returns: &[f64], innovations: Innovations) -> Result<GarchFit, VolatilityFitError> {
    let n = returns.len();
    if n <= GARCH_MIN_OBSERVATIONS {
        return Err(VolatilityFitError::InsufficientData {
            needed: GARCH_MIN_OBSERVATIONS,
            got: n,
        });
    }
    let initial = sample_std_dev(returns).powi(2);
    if !(initial > 0.0 && initial.is_finite()) {
        return Err(VolatilityFitError::NonPositive(initial));
    }

    let objective = |p: &GarchParams| -> f64 {
        if !p.is_admissible() {
            return f64::NEG_INFINITY;
        }
        let variance = conditional_variance(returns, p, initial);
        log_likelihood(returns, &variance, p, innovations)
    };

    let nu_grid: &[f64] = match innovations {
        Innovations::StudentT => &[4.0, 6.0, 10.0, 20.0],
        Innovations::Normal => &[f64::INFINITY],
    };

    let mut best: Option<(GarchParams, f64)> = None;
    for &persistence_share in &[0.02, 0.05, 0.1, 0.2] {
        for &alpha in &[0.03, 0.05, 0.1, 0.15, 0.2] {
            for &beta in &[0.6, 0.7, 0.8, 0.85, 0.9, 0.95] {
                if alpha + beta >= MAX_PERSISTENCE {
                    continue;
                }
                for &nu in nu_grid {
                    let candidate = GarchParams {
                        omega: initial * persistence_share,
                        alpha,
                        beta,
                        nu,
                    };
                    let ll = objective(&candidate);
                    if ll.is_finite() && best.is_none_or(|(_, b)| ll > b) {
                        best = Some((candidate, ll));
                    }
                }
            }
        }
    }
    let (mut params, mut ll) = best.ok_or(VolatilityFitError::NoFiniteOptimum)?;

    // Local refinement with shrinking steps.
    let mut step = 0.02;
    for _ in 0..REFINE_ITERATIONS {
        let mut improved = false;
        let mut candidates = Vec::with_capacity(8);
        for sign in [-1.0, 1.0] {
            candidates.push(GarchParams {
                omega: (params.omega * (1.0 + sign * step * 5.0)).max(1e-14),
                ..params
            });
            candidates.push(GarchParams {
                alpha: (params.alpha + sign * step).clamp(0.0, 0.5),
                ..params
            });
            candidates.push(GarchParams {
                beta: (params.beta + sign * step).clamp(0.0, 0.998),
                ..params
            });
            if innovations == Innovations::StudentT {
                candidates.push(GarchParams {
                    nu: (params.nu + sign * step * 50.0).clamp(MIN_NU, MAX_NU),
                    ..params
                });
            }
        }
        for candidate in candidates {
            let candidate_ll = objective(&candidate);
            if candidate_ll.is_finite() && candidate_ll > ll {
                params = candidate;
                ll = candidate_ll;
                improved = true;
            }
        }
        if !improved {
            step *= 0.5;
            if step < 1e-5 {
                break;
            }
        }
    }

    let variance = conditional_variance(returns, &params, initial);
    let last_volatility = variance.last().copied().unwrap_or(initial).sqrt();
    if !last_volatility.is_finite() {
        return Err(VolatilityFitError::NoFiniteOptimum);
    }
    if last_volatility <= 0.0 {
        return Err(VolatilityFitError::NonPositive(last_volatility));
    }

    Ok(GarchFit {
        omega: params.omega,
        alpha: params.alpha,
        beta: params.beta,
        nu: (innovations == Innovations::StudentT).then_some(params.nu),
        innovations,
        log_likelihood: ll,
        last_volatility,
    })
}

#[derive(Clone, Copy, Debug)]
pub struct ConditionalVolatilityEstimator {
    pub innovations: Innovations,
}

impl Default for ConditionalVolatilityEstimator {
    fn default() -> Self {
        Self {
            innovations: Innovations::StudentT,
        }
    }
}

impl VolatilityEstimator for ConditionalVolatilityEstimator {
    fn source(&self) -> VolatilitySource {
        VolatilitySource::Conditional
    }

    fn estimate(&self, returns: &[f64]) -> Result<f64, VolatilityFitError> {
        let fit = match fit_garch(returns, self.innovations) {
            Ok(fit) => fit,
            Err(e @ VolatilityFitError::InsufficientData { .. }) => return Err(e),
            Err(e) if self.innovations == Innovations::StudentT => {
                debug!("Student-t GARCH fit failed ({}); retrying with normal innovations", e);
                fit_garch(returns, Innovations::Normal)?
            }
            Err(e) => return Err(e),
        };
        debug!(
            "GARCH(1,1) omega={:.3e} alpha={:.4} beta={:.4} nu={:?} ll={:.2}",
            fit.omega, fit.alpha, fit.beta, fit.nu, fit.log_likelihood
        );
        Ok(fit.last_volatility)
    }
}

/// Runs `estimator` over every series.
///
/// When the estimator is conditional and any asset fails or yields σ ≤ 0, every
/// asset is recomputed with the sample standard deviation. A run where no asset
/// ends with σ > 0 is a terminal error.
pub fn estimate_volatilities(
    series: &[LogReturnSeries],
    estimator: &dyn VolatilityEstimator,
) -> Result<Vec<VolatilityEstimate>, RiskError> {
    let primary: Vec<Result<f64, VolatilityFitError>> = series
        .iter()
        .map(|s| estimator.estimate(&s.observed()))
        .collect();

    let failed: Vec<&str> = series
        .iter()
        .zip(&primary)
        .filter(|(_, r)| !matches!(r, Ok(sigma) if *sigma > 0.0 && sigma.is_finite()))
        .map(|(s, _)| s.asset.as_str())
        .collect();

    let estimates: Vec<VolatilityEstimate> = if estimator.is_conditional() && !failed.is_empty() {
        warn!(
            "Conditional volatility unavailable for {:?}; using sample standard deviation for every asset",
            failed
        );
        sample_estimates(series)
    } else {
        series
            .iter()
            .zip(primary)
            .map(|(s, r)| VolatilityEstimate {
                asset: s.asset.clone(),
                sigma: r.unwrap_or_else(|e| {
                    warn!("{}: volatility estimate unavailable ({})", s.asset, e);
                    0.0
                }),
                source: estimator.source(),
            })
            .collect()
    };

    if !estimates.iter().any(|v| v.sigma > 0.0 && v.sigma.is_finite()) {
        return Err(RiskError::numeric(
            "Not enough volatility data could be computed for risk analysis",
        ));
    }
    for v in estimates.iter().filter(|v| !(v.sigma > 0.0)) {
        warn!("{}: volatility is zero or undefined; simulation may be affected", v.asset);
    }
    info!(
        "Volatility ({}): {}",
        estimates.first().map(|v| v.source.as_str()).unwrap_or("none"),
        estimates
            .iter()
            .map(|v| format!("{}={:.5}", v.asset, v.sigma))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(estimates)
}

fn sample_estimates(series: &[LogReturnSeries]) -> Vec<VolatilityEstimate> {
    series
        .iter()
        .map(|s| {
            let sigma = SampleStdDevEstimator
                .estimate(&s.observed())
                .ok()
                .filter(|v| v.is_finite())
                .unwrap_or(0.0);
            VolatilityEstimate {
                asset: s.asset.clone(),
                sigma,
                source: VolatilitySource::SampleStddev,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn garch_path(n: usize, seed: u64, omega: f64, alpha: f64, beta: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut h = omega / (1.0 - alpha - beta);
        let mut prev = 0.0;
        (0..n)
            .map(|_| {
                h = omega + alpha * prev * prev + beta * h;
                let z: f64 = StandardNormal.sample(&mut rng);
                prev = h.sqrt() * z;
                prev
            })
            .collect()
    }

    fn series(asset: &str, values: &[f64]) -> LogReturnSeries {
        LogReturnSeries {
            asset: asset.to_string(),
            values: values.iter().copied().map(Some).collect(),
        }
    }

    #[test]
    fn test_garch_fit_is_stationary_and_plausible() {
        let returns = garch_path(800, 17, 2e-6, 0.08, 0.9);
        let fit = fit_garch(&returns, Innovations::StudentT).unwrap();
        assert!(fit.alpha + fit.beta < MAX_PERSISTENCE);
        assert!(fit.omega > 0.0);
        assert!(fit.nu.unwrap() > 2.0);
        let sd = sample_std_dev(&returns);
        assert!(fit.last_volatility > 0.2 * sd && fit.last_volatility < 5.0 * sd);
    }

    #[test]
    fn test_normal_innovations_report_no_nu() {
        let returns = garch_path(300, 3, 1e-6, 0.1, 0.85);
        let fit = fit_garch(&returns, Innovations::Normal).unwrap();
        assert_eq!(fit.nu, None);
        assert_eq!(fit.innovations, Innovations::Normal);
    }

    #[test]
    fn test_garch_requires_more_than_thirty_observations() {
        let returns = garch_path(30, 1, 1e-6, 0.1, 0.85);
        assert_eq!(
            ConditionalVolatilityEstimator::default().estimate(&returns),
            Err(VolatilityFitError::InsufficientData { needed: 30, got: 30 })
        );
        let longer = garch_path(31, 1, 1e-6, 0.1, 0.85);
        assert!(ConditionalVolatilityEstimator::default().estimate(&longer).is_ok());
    }

    #[test]
    fn test_sample_estimator_uses_bessel_correction() {
        let sigma = SampleStdDevEstimator.estimate(&[0.01, -0.01, 0.02, -0.02]).unwrap();
        assert_relative_eq!(sigma, sample_std_dev(&[0.01, -0.01, 0.02, -0.02]), epsilon = 1e-15);
        assert!(SampleStdDevEstimator.estimate(&[0.01]).is_err());
    }

    #[test]
    fn test_one_failing_asset_forces_sample_estimator_on_all() {
        let good = garch_path(200, 5, 2e-6, 0.1, 0.85);
        let flat = vec![0.0; 200];
        let input = vec![series("USD", &good), series("EUR", &flat)];

        let estimates =
            estimate_volatilities(&input, &ConditionalVolatilityEstimator::default()).unwrap();
        assert!(estimates.iter().all(|v| v.source == VolatilitySource::SampleStddev));
        assert_relative_eq!(estimates[0].sigma, sample_std_dev(&good), epsilon = 1e-15);
        assert_eq!(estimates[1].sigma, 0.0);
    }

    #[test]
    fn test_conditional_estimates_kept_when_all_succeed() {
        let input = vec![
            series("USD", &garch_path(200, 8, 2e-6, 0.1, 0.85)),
            series("EUR", &garch_path(200, 9, 4e-6, 0.05, 0.9)),
        ];
        let estimates =
            estimate_volatilities(&input, &ConditionalVolatilityEstimator::default()).unwrap();
        assert!(estimates.iter().all(|v| v.source == VolatilitySource::Conditional));
        assert!(estimates.iter().all(|v| v.sigma > 0.0));
    }

    #[test]
    fn test_no_positive_volatility_is_terminal() {
        let input = vec![series("USD", &[0.0; 50]), series("EUR", &[0.0; 50])];
        let err = estimate_volatilities(&input, &SampleStdDevEstimator).unwrap_err();
        assert!(matches!(err, RiskError::Numeric(_)));
    }

    #[test]
    fn test_estimator_for_model() {
        assert!(estimator_for(VolatilityModel::Garch).is_conditional());
        assert!(!estimator_for(VolatilityModel::Sample).is_conditional());
    }
}
