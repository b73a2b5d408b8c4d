use crate::config::MIN_PAIR_OVERLAP_FRACTION;
use crate::error::FactorizationError;
use crate::returns::LogReturnSeries;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Pairwise Pearson correlations; `None` where two assets overlap too little.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub assets: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.values.get(i).and_then(|row| row.get(j)).copied().flatten()
    }

    pub fn has_undefined(&self) -> bool {
        self.values.iter().flatten().any(Option::is_none)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorMode {
    /// True Cholesky factor of the covariance matrix.
    Correlated,
    /// `diag(σ)`; shocks are simulated independently.
    Degraded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceFactor {
    pub matrix: DMatrix<f64>,
    pub mode: FactorMode,
}

impl CovarianceFactor {
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// `ε = L·z`.
    pub fn correlate(&self, z: &DVector<f64>) -> DVector<f64> {
        &self.matrix * z
    }
}

/// Minimum pairwise overlap for a defined coefficient.
pub fn min_overlap(fully_overlapping_rows: usize) -> usize {
    ((MIN_PAIR_OVERLAP_FRACTION * fully_overlapping_rows as f64).floor() as usize).max(2)
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for &(x, y) in pairs {
        sxy += (x - mx) * (y - my);
        sxx += (x - mx).powi(2);
        syy += (y - my).powi(2);
    }
    let denom = (sxx * syy).sqrt();
    if denom > 0.0 && denom.is_finite() {
        Some((sxy / denom).clamp(-1.0, 1.0))
    } else {
        None
    }
}

/// Correlation matrix of aligned return series.
pub fn correlation_matrix(series: &[LogReturnSeries]) -> CorrelationMatrix {
    let n = series.len();
    let rows = series.iter().map(LogReturnSeries::len).min().unwrap_or(0);
    let full_rows = (0..rows)
        .filter(|&t| series.iter().all(|s| s.values[t].is_some()))
        .count();
    let required = min_overlap(full_rows);
    debug!(
        "Correlation over {} rows ({} fully overlapping, min pair overlap {})",
        rows, full_rows, required
    );

    let mut values = vec![vec![None; n]; n];
    for i in 0..n {
        values[i][i] = Some(1.0);
        for j in (i + 1)..n {
            let pairs: Vec<(f64, f64)> = (0..rows)
                .filter_map(|t| Some((series[i].values[t]?, series[j].values[t]?)))
                .collect();
            let rho = if pairs.len() >= required {
                pearson(&pairs)
            } else {
                None
            };
            if rho.is_none() {
                warn!(
                    "Correlation {}/{} undefined ({} overlapping observations, {} required)",
                    series[i].asset,
                    series[j].asset,
                    pairs.len(),
                    required
                );
            }
            values[i][j] = rho;
            values[j][i] = rho;
        }
    }

    CorrelationMatrix {
        assets: series.iter().map(|s| s.asset.clone()).collect(),
        values,
    }
}

/// `Σ = D·R·D`; undefined correlations become `NaN`.
pub fn covariance_matrix(corr: &CorrelationMatrix, vols: &[f64]) -> DMatrix<f64> {
    let n = corr.len().min(vols.len());
    DMatrix::from_fn(n, n, |i, j| corr.get(i, j).map_or(f64::NAN, |rho| vols[i] * rho * vols[j]))
}

/// Lower-triangular Cholesky factor of `sigma`.
pub fn cholesky_factor(sigma: &DMatrix<f64>) -> Result<DMatrix<f64>, FactorizationError> {
    if sigma.iter().any(|v| !v.is_finite()) {
        return Err(FactorizationError::Undefined);
    }
    let chol = sigma
        .clone()
        .cholesky()
        .ok_or(FactorizationError::NotPositiveDefinite)?;
    let l = chol.l();
    if l.iter().any(|v| !v.is_finite()) {
        return Err(FactorizationError::NotPositiveDefinite);
    }
    Ok(l)
}

/// Cholesky factor of `D·R·D`, or `diag(vols)` when it cannot be computed.
pub fn factorize(corr: &CorrelationMatrix, vols: &[f64]) -> CovarianceFactor {
    let sigma = covariance_matrix(corr, vols);
    match cholesky_factor(&sigma) {
        Ok(matrix) => CovarianceFactor {
            matrix,
            mode: FactorMode::Correlated,
        },
        Err(e) => {
            warn!(
                "Covariance factorisation failed ({}); simulating assets without correlation",
                e
            );
            let n = sigma.nrows();
            CovarianceFactor {
                matrix: DMatrix::from_diagonal(&DVector::from_iterator(n, vols.iter().take(n).copied())),
                mode: FactorMode::Degraded,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn series(asset: &str, values: Vec<Option<f64>>) -> LogReturnSeries {
        LogReturnSeries {
            asset: asset.to_string(),
            values,
        }
    }

    fn manual(values: Vec<Vec<Option<f64>>>) -> CorrelationMatrix {
        CorrelationMatrix {
            assets: (0..values.len()).map(|i| format!("A{}", i)).collect(),
            values,
        }
    }

    #[test]
    fn test_min_overlap_rule() {
        assert_eq!(min_overlap(0), 2);
        assert_eq!(min_overlap(2), 2);
        assert_eq!(min_overlap(10), 8);
        assert_eq!(min_overlap(359), 287);
    }

    #[test]
    fn test_perfectly_correlated_pair() {
        let a: Vec<Option<f64>> = (0..20).map(|i| Some((i as f64 * 0.7).sin() * 0.01)).collect();
        let b: Vec<Option<f64>> = a.iter().map(|v| v.map(|x| 2.0 * x + 0.001)).collect();
        let c: Vec<Option<f64>> = a.iter().map(|v| v.map(|x| -x)).collect();
        let corr = correlation_matrix(&[series("USD", a), series("EUR", b), series("Gold_Gram_TL", c)]);
        assert_relative_eq!(corr.get(0, 1).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(corr.get(0, 2).unwrap(), -1.0, epsilon = 1e-12);
        assert_eq!(corr.get(1, 0), corr.get(0, 1));
        for i in 0..3 {
            assert_eq!(corr.get(i, i), Some(1.0));
        }
    }

    #[test]
    fn test_sparse_overlap_leaves_pair_undefined() {
        let usd = vec![Some(0.01), Some(-0.02), None, None, None, None];
        let eur = vec![Some(0.02), Some(-0.01), Some(0.0), Some(0.01), Some(0.03), Some(-0.02)];
        let gold = vec![Some(0.01), Some(0.02), Some(-0.01), Some(0.0), Some(0.02), Some(0.01)];
        let corr = correlation_matrix(&[series("USD", usd), series("EUR", eur), series("Gold", gold)]);
        // Two fully overlapping rows -> min overlap 2, so USD/EUR is defined.
        assert!(corr.get(0, 1).is_some());
        assert!(corr.get(1, 2).is_some());

        let usd = vec![Some(0.01), None, None, None, None, None];
        let eur = vec![Some(0.02), Some(-0.01), Some(0.0), Some(0.01), Some(0.03), Some(-0.02)];
        let corr = correlation_matrix(&[series("USD", usd), series("EUR", eur)]);
        assert_eq!(corr.get(0, 1), None);
        assert!(corr.has_undefined());
    }

    #[test]
    fn test_factor_reproduces_covariance() {
        let corr = manual(vec![
            vec![Some(1.0), Some(0.5)],
            vec![Some(0.5), Some(1.0)],
        ]);
        let vols = [0.01, 0.02];
        let factor = factorize(&corr, &vols);
        assert_eq!(factor.mode, FactorMode::Correlated);
        let rebuilt = &factor.matrix * factor.matrix.transpose();
        let sigma = covariance_matrix(&corr, &vols);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(rebuilt[(i, j)], sigma[(i, j)], epsilon = 1e-15);
            }
        }
        assert_eq!(factor.matrix[(0, 1)], 0.0);
    }

    #[test]
    fn test_non_psd_input_degrades_to_diagonal() {
        let corr = manual(vec![
            vec![Some(1.0), Some(0.9), Some(-0.9)],
            vec![Some(0.9), Some(1.0), Some(0.9)],
            vec![Some(-0.9), Some(0.9), Some(1.0)],
        ]);
        let vols = [0.01, 0.02, 0.03];
        let factor = factorize(&corr, &vols);
        assert_eq!(factor.mode, FactorMode::Degraded);
        assert_eq!(factor.matrix, DMatrix::from_diagonal(&DVector::from_vec(vols.to_vec())));
    }

    #[test]
    fn test_undefined_entry_degrades_to_diagonal() {
        let corr = manual(vec![vec![Some(1.0), None], vec![None, Some(1.0)]]);
        assert_eq!(
            cholesky_factor(&covariance_matrix(&corr, &[0.01, 0.02])),
            Err(FactorizationError::Undefined)
        );
        let factor = factorize(&corr, &[0.01, 0.02]);
        assert_eq!(factor.mode, FactorMode::Degraded);
        assert_eq!(factor.matrix[(1, 1)], 0.02);
    }

    #[test]
    fn test_correlate_is_matrix_vector_product() {
        let factor = CovarianceFactor {
            matrix: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 3.0]),
            mode: FactorMode::Correlated,
        };
        let eps = factor.correlate(&DVector::from_vec(vec![1.0, -1.0]));
        assert_eq!(eps.as_slice(), &[2.0, -2.0]);
    }
}
