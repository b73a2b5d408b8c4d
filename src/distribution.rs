use crate::config::CHI_SQUARE_EPSILON;
use crate::error::FitError;
use crate::returns::{mean, population_std_dev, sample_std_dev, LogReturnSeries};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Laplace, Normal, StudentsT};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;
use tracing::{debug, warn};

/// Smallest scale accepted from a fit; anything below is treated as a degenerate series.
const MIN_SCALE: f64 = 1e-12;

/// Degrees-of-freedom search range for the Student-t fit.
const STUDENT_T_MIN_DF: f64 = 2.05;
const STUDENT_T_MAX_DF: f64 = 200.0;
const STUDENT_T_GRID_POINTS: usize = 60;
const STUDENT_T_EM_ITERATIONS: usize = 200;
const STUDENT_T_GOLDEN_ITERATIONS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Normal,
    StudentT,
    Laplace,
}

impl Family {
    /// Default candidate list, in tie-breaking order.
    pub const ALL: [Family; 3] = [Family::Normal, Family::StudentT, Family::Laplace];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::StudentT => "student_t",
            Self::Laplace => "laplace",
        }
    }

    /// Maximum-likelihood parameters of this family for `data`.
    pub fn fit(self, data: &[f64]) -> Result<DistributionParams, FitError> {
        match self {
            Self::Normal => fit_normal(data),
            Self::StudentT => fit_student_t(data),
            Self::Laplace => fit_laplace(data),
        }
    }

    pub fn supports_anderson_darling(self) -> bool {
        matches!(self, Self::Normal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DistributionParams {
    Normal { loc: f64, scale: f64 },
    StudentT { df: f64, loc: f64, scale: f64 },
    Laplace { loc: f64, scale: f64 },
}

impl DistributionParams {
    pub fn family(&self) -> Family {
        match self {
            Self::Normal { .. } => Family::Normal,
            Self::StudentT { .. } => Family::StudentT,
            Self::Laplace { .. } => Family::Laplace,
        }
    }

    /// Cumulative distribution function at `x`.
    pub fn cdf(&self, x: f64) -> Result<f64, FitError> {
        let value = match *self {
            Self::Normal { loc, scale } => Normal::new(loc, scale)
                .map_err(|e| FitError::InvalidParameters(e.to_string()))?
                .cdf(x),
            Self::StudentT { df, loc, scale } => StudentsT::new(loc, scale, df)
                .map_err(|e| FitError::InvalidParameters(e.to_string()))?
                .cdf(x),
            Self::Laplace { loc, scale } => Laplace::new(loc, scale)
                .map_err(|e| FitError::InvalidParameters(e.to_string()))?
                .cdf(x),
        };
        Ok(value)
    }

    /// Shock generator drawing from this distribution.
    pub fn sampler(&self) -> ShockSampler {
        match *self {
            Self::Normal { loc, scale } => rand_distr::Normal::new(loc, scale)
                .map(ShockSampler::Normal)
                .unwrap_or(ShockSampler::StandardNormal),
            Self::StudentT { df, loc, scale } => rand_distr::StudentT::new(df)
                .map(|dist| ShockSampler::StudentT { dist, loc, scale })
                .unwrap_or(ShockSampler::StandardNormal),
            Self::Laplace { loc, scale } => ShockSampler::Laplace { loc, scale },
        }
    }
}

/// Draws one independent shock per call.
#[derive(Clone, Debug)]
pub enum ShockSampler {
    StandardNormal,
    Normal(rand_distr::Normal<f64>),
    StudentT {
        dist: rand_distr::StudentT<f64>,
        loc: f64,
        scale: f64,
    },
    Laplace {
        loc: f64,
        scale: f64,
    },
}

impl ShockSampler {
    /// A non-finite draw is replaced by a standard normal one.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let draw: f64 = match self {
            Self::StandardNormal => StandardNormal.sample(rng),
            Self::Normal(dist) => dist.sample(rng),
            Self::StudentT { dist, loc, scale } => loc + scale * dist.sample(rng),
            Self::Laplace { loc, scale } => {
                // Inverse CDF on u in [-0.5, 0.5).
                let u: f64 = rng.r#gen::<f64>() - 0.5;
                loc - scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
            }
        };
        if draw.is_finite() {
            draw
        } else {
            StandardNormal.sample(rng)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoodnessOfFit {
    pub ks: f64,
    pub chi_square: f64,
    /// `None` for families where the statistic is not applicable.
    pub anderson_darling: Option<f64>,
    /// Mean of the available statistics; lower is better.
    pub score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedDistribution {
    pub asset: String,
    pub params: DistributionParams,
    pub fit: GoodnessOfFit,
}

impl FittedDistribution {
    pub fn family(&self) -> Family {
        self.params.family()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Maximum-likelihood fits
// ──────────────────────────────────────────────────────────────────────────────

fn require_observations(data: &[f64], needed: usize) -> Result<(), FitError> {
    if data.len() < needed {
        return Err(FitError::InsufficientData {
            needed,
            got: data.len(),
        });
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite("observation"));
    }
    Ok(())
}

fn fit_normal(data: &[f64]) -> Result<DistributionParams, FitError> {
    require_observations(data, 2)?;
    let loc = mean(data);
    let scale = population_std_dev(data);
    if !(scale > MIN_SCALE) {
        return Err(FitError::ZeroDispersion);
    }
    Ok(DistributionParams::Normal { loc, scale })
}

fn median(data: &[f64]) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

fn fit_laplace(data: &[f64]) -> Result<DistributionParams, FitError> {
    require_observations(data, 2)?;
    let loc = median(data);
    let scale = data.iter().map(|x| (x - loc).abs()).sum::<f64>() / data.len() as f64;
    if !(scale > MIN_SCALE) {
        return Err(FitError::ZeroDispersion);
    }
    Ok(DistributionParams::Laplace { loc, scale })
}

fn student_t_log_likelihood(data: &[f64], df: f64, loc: f64, scale: f64) -> f64 {
    let norm = ln_gamma((df + 1.0) * 0.5) - ln_gamma(df * 0.5) - 0.5 * (df * PI).ln() - scale.ln();
    data.iter()
        .map(|&x| {
            let z = (x - loc) / scale;
            norm - 0.5 * (df + 1.0) * (1.0 + z * z / df).ln()
        })
        .sum()
}

/// Location and scale maximising the likelihood for a fixed `df` (EM iterations).
fn student_t_loc_scale(data: &[f64], df: f64, start_loc: f64, start_scale: f64) -> (f64, f64) {
    let n = data.len() as f64;
    let mut loc = start_loc;
    let mut scale = start_scale;
    for _ in 0..STUDENT_T_EM_ITERATIONS {
        let mut w_sum = 0.0;
        let mut wx_sum = 0.0;
        let weights: Vec<f64> = data
            .iter()
            .map(|&x| {
                let z = (x - loc) / scale;
                (df + 1.0) / (df + z * z)
            })
            .collect();
        for (&w, &x) in weights.iter().zip(data) {
            w_sum += w;
            wx_sum += w * x;
        }
        let new_loc = wx_sum / w_sum;
        let var = weights
            .iter()
            .zip(data)
            .map(|(&w, &x)| w * (x - new_loc).powi(2))
            .sum::<f64>()
            / n;
        let new_scale = var.sqrt().max(MIN_SCALE);
        let converged = (new_loc - loc).abs() < 1e-12 * (1.0 + loc.abs())
            && (new_scale - scale).abs() < 1e-10 * scale;
        loc = new_loc;
        scale = new_scale;
        if converged {
            break;
        }
    }
    (loc, scale)
}

fn fit_student_t(data: &[f64]) -> Result<DistributionParams, FitError> {
    require_observations(data, 3)?;
    let start_loc = median(data);
    let start_scale = sample_std_dev(data);
    if !(start_scale > MIN_SCALE) {
        return Err(FitError::ZeroDispersion);
    }

    let profile = |df: f64| -> (f64, f64, f64) {
        let (loc, scale) = student_t_loc_scale(data, df, start_loc, start_scale);
        (student_t_log_likelihood(data, df, loc, scale), loc, scale)
    };

    // Coarse log-spaced grid over df, then golden-section search around the best point.
    let log_min = STUDENT_T_MIN_DF.ln();
    let log_max = STUDENT_T_MAX_DF.ln();
    let step = (log_max - log_min) / (STUDENT_T_GRID_POINTS - 1) as f64;
    let grid: Vec<f64> = (0..STUDENT_T_GRID_POINTS)
        .map(|i| (log_min + step * i as f64).exp())
        .collect();

    let mut best_idx = None;
    let mut best_ll = f64::NEG_INFINITY;
    for (i, &df) in grid.iter().enumerate() {
        let (ll, _, _) = profile(df);
        if ll.is_finite() && ll > best_ll {
            best_ll = ll;
            best_idx = Some(i);
        }
    }
    let best_idx = best_idx.ok_or(FitError::NonFinite("log-likelihood"))?;

    let mut lo = grid[best_idx.saturating_sub(1)];
    let mut hi = grid[(best_idx + 1).min(grid.len() - 1)];
    let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = hi - inv_phi * (hi - lo);
    let mut d = lo + inv_phi * (hi - lo);
    let mut fc = profile(c).0;
    let mut fd = profile(d).0;
    for _ in 0..STUDENT_T_GOLDEN_ITERATIONS {
        if fc > fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - inv_phi * (hi - lo);
            fc = profile(c).0;
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + inv_phi * (hi - lo);
            fd = profile(d).0;
        }
    }

    let mut df = grid[best_idx];
    let (mut ll, mut loc, mut scale) = profile(df);
    let mid = 0.5 * (lo + hi);
    let refined = profile(mid);
    if refined.0.is_finite() && refined.0 > ll {
        df = mid;
        (ll, loc, scale) = refined;
    }

    if !ll.is_finite() || !loc.is_finite() || !scale.is_finite() {
        return Err(FitError::NonFinite("student_t parameters"));
    }
    Ok(DistributionParams::StudentT { df, loc, scale })
}

// ──────────────────────────────────────────────────────────────────────────────
// Goodness-of-fit statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Two-sided Kolmogorov–Smirnov statistic of `data` against `params`.
pub fn ks_statistic(data: &[f64], params: &DistributionParams) -> Result<f64, FitError> {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let mut d = 0.0_f64;
    for (i, &x) in sorted.iter().enumerate() {
        let f = params.cdf(x)?;
        let d_plus = (i as f64 + 1.0) / n - f;
        let d_minus = f - i as f64 / n;
        d = d.max(d_plus).max(d_minus);
    }
    Ok(d)
}

/// Equal-width histogram over `[min, max]` with the last bin closed.
///
/// Returns the bin counts and the `bins + 1` edges.
pub fn histogram(data: &[f64], bins: usize) -> (Vec<usize>, Vec<f64>) {
    let mut lo = data.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / bins as f64;
    let mut edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
    edges[bins] = hi;

    let mut counts = vec![0usize; bins];
    for &x in data {
        counts[bin_index(x, &edges)] += 1;
    }
    (counts, edges)
}

/// Bin of `x` within `edges` (which span the data), checked against the edge values
/// so a point sitting on an interior edge always opens the upper bin.
fn bin_index(x: f64, edges: &[f64]) -> usize {
    let bins = edges.len() - 1;
    let (lo, hi) = (edges[0], edges[bins]);
    let norm = bins as f64 / (hi - lo);
    let mut idx = (((x - lo) * norm).max(0.0) as usize).min(bins - 1);
    if idx > 0 && x < edges[idx] {
        idx -= 1;
    } else if idx + 1 < bins && x >= edges[idx + 1] {
        idx += 1;
    }
    idx
}

/// Chi-square distance between histogram counts and the counts implied by `params`.
pub fn chi_square_statistic(
    data: &[f64],
    params: &DistributionParams,
    bins: usize,
) -> Result<f64, FitError> {
    let (counts, edges) = histogram(data, bins);
    let cdf_at_edges = edges
        .iter()
        .map(|&e| params.cdf(e))
        .collect::<Result<Vec<f64>, FitError>>()?;
    let n = data.len() as f64;
    let stat = counts
        .iter()
        .zip(cdf_at_edges.windows(2))
        .map(|(&observed, w)| {
            let expected = n * (w[1] - w[0]);
            (observed as f64 - expected).powi(2) / (expected + CHI_SQUARE_EPSILON)
        })
        .filter(|term| !term.is_nan())
        .sum();
    Ok(stat)
}

/// Anderson–Darling A² for normality, with mean and standard deviation estimated
/// from the sample. `None` when the statistic is not finite.
pub fn anderson_darling_normal(data: &[f64]) -> Option<f64> {
    let n = data.len();
    if n < 2 {
        return None;
    }
    let m = mean(data);
    let s = sample_std_dev(data);
    if !(s > MIN_SCALE) {
        return None;
    }
    let std_normal = Normal::new(0.0, 1.0).ok()?;
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let z: Vec<f64> = sorted.iter().map(|x| (x - m) / s).collect();

    let nf = n as f64;
    let sum: f64 = (0..n)
        .map(|i| {
            let log_cdf = std_normal.cdf(z[i]).ln();
            let log_sf = std_normal.sf(z[n - 1 - i]).ln();
            (2.0 * (i as f64 + 1.0) - 1.0) * (log_cdf + log_sf)
        })
        .sum();
    let a2 = -nf - sum / nf;
    a2.is_finite().then_some(a2)
}

/// Fits `family` to `data` and scores the result.
pub fn evaluate_candidate(
    data: &[f64],
    family: Family,
    bins: usize,
) -> Result<(DistributionParams, GoodnessOfFit), FitError> {
    let params = family.fit(data)?;
    let ks = ks_statistic(data, &params)?;
    let chi_square = chi_square_statistic(data, &params, bins)?;
    let anderson_darling = if family.supports_anderson_darling() {
        anderson_darling_normal(data)
    } else {
        None
    };

    let mut stats = vec![ks, chi_square];
    stats.extend(anderson_darling);
    let score = mean(&stats);
    if !score.is_finite() {
        return Err(FitError::NonFinite("goodness-of-fit score"));
    }
    Ok((
        params,
        GoodnessOfFit {
            ks,
            chi_square,
            anderson_darling,
            score,
        },
    ))
}

/// Best-scoring candidate for one asset, or `None` when every candidate failed.
pub fn fit_best(
    asset: &str,
    data: &[f64],
    families: &[Family],
    bins: usize,
) -> Option<FittedDistribution> {
    let mut best: Option<FittedDistribution> = None;
    for &family in families {
        match evaluate_candidate(data, family, bins) {
            Ok((params, fit)) => {
                debug!(
                    "{}: {} score={:.4} (ks={:.4}, chi2={:.4}, ad={:?})",
                    asset,
                    family.as_str(),
                    fit.score,
                    fit.ks,
                    fit.chi_square,
                    fit.anderson_darling
                );
                let better = best.as_ref().is_none_or(|b| fit.score < b.fit.score);
                if better {
                    best = Some(FittedDistribution {
                        asset: asset.to_string(),
                        params,
                        fit,
                    });
                }
            }
            Err(e) => warn!(
                "{}: {} fit failed ({}); remaining candidates continue",
                asset,
                family.as_str(),
                e
            ),
        }
    }
    if best.is_none() {
        warn!("{}: no candidate distribution could be fitted; standard normal shocks will be used", asset);
    }
    best
}

/// Fits every return series, preserving input order.
pub fn fit_all(
    series: &[LogReturnSeries],
    families: &[Family],
    bins: usize,
) -> Vec<Option<FittedDistribution>> {
    series
        .iter()
        .map(|s| fit_best(&s.asset, &s.observed(), families, bins))
        .collect()
}
