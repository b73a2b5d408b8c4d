use crate::config::SIMULATION_BATCH_SIZE;
use crate::correlation::CovarianceFactor;
use crate::distribution::{DistributionParams, ShockSampler};
use crate::error::SimulationError;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cooperative stop signal, checked between trial batches.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the simulator needs about one modelled asset.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetModel {
    pub asset: String,
    /// Current value in TL.
    pub value: f64,
    /// Mean daily log return.
    pub drift: f64,
    pub sigma: f64,
    /// Shock distribution; standard normal when absent.
    pub distribution: Option<DistributionParams>,
}

/// Terminal portfolio values, one per trial, in trial order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub terminal_values: Vec<f64>,
    pub seed: u64,
}

impl SimulationOutcome {
    pub fn len(&self) -> usize {
        self.terminal_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminal_values.is_empty()
    }
}

/// SplitMix64 mix of the run seed and the trial index.
pub fn derive_trial_seed(run_seed: u64, trial: u64) -> u64 {
    let mut z = run_seed ^ trial.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One daily update `S' = S·exp((μ − ½σ²) + σ·ε)`.
///
/// A zero (or negative) value stays at zero; a non-finite result keeps `value`.
pub fn gbm_step(value: f64, drift: f64, sigma: f64, shock: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    const DT: f64 = 1.0;
    let exponent = (drift - 0.5 * sigma * sigma) * DT + sigma * shock * DT.sqrt();
    let next = value * exponent.exp();
    if next.is_finite() { next.max(0.0) } else { value }
}

struct PreparedAssets<'a> {
    samplers: Vec<ShockSampler>,
    models: &'a [AssetModel],
    factor: &'a CovarianceFactor,
}

#[derive(Clone, Debug)]
pub struct MonteCarloSimulator {
    pub num_simulations: usize,
    pub num_days: usize,
    pub seed: u64,
    cancel: CancellationToken,
}

impl MonteCarloSimulator {
    pub fn new(num_simulations: usize, num_days: usize, seed: u64) -> Self {
        Self {
            num_simulations,
            num_days,
            seed,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn prepare<'a>(
        &self,
        models: &'a [AssetModel],
        factor: &'a CovarianceFactor,
    ) -> Result<PreparedAssets<'a>, SimulationError> {
        if models.is_empty() {
            return Err(SimulationError::NoAssets);
        }
        let (rows, cols) = factor.matrix.shape();
        if rows != models.len() || cols != models.len() {
            return Err(SimulationError::DimensionMismatch {
                rows,
                cols,
                assets: models.len(),
            });
        }
        let samplers = models
            .iter()
            .map(|m| {
                m.distribution
                    .as_ref()
                    .map(DistributionParams::sampler)
                    .unwrap_or(ShockSampler::StandardNormal)
            })
            .collect();
        Ok(PreparedAssets {
            samplers,
            models,
            factor,
        })
    }

    /// Runs one trial, calling `on_day` with the asset values after every step.
    fn run_trial(&self, prepared: &PreparedAssets<'_>, trial: usize, mut on_day: impl FnMut(&[f64])) -> f64 {
        let mut rng = StdRng::seed_from_u64(derive_trial_seed(self.seed, trial as u64));
        let n = prepared.models.len();
        let mut values: Vec<f64> = prepared.models.iter().map(|m| m.value).collect();

        for _ in 0..self.num_days {
            let z = DVector::from_iterator(n, prepared.samplers.iter().map(|s| s.sample(&mut rng)));
            let eps = prepared.factor.correlate(&z);
            for (i, model) in prepared.models.iter().enumerate() {
                values[i] = gbm_step(values[i], model.drift, model.sigma, eps[i]);
            }
            on_day(&values);
        }
        values.iter().sum()
    }

    /// Terminal portfolio value of every trial.
    pub fn run(
        &self,
        models: &[AssetModel],
        factor: &CovarianceFactor,
    ) -> Result<SimulationOutcome, SimulationError> {
        let prepared = self.prepare(models, factor)?;
        let num_batches = self.num_simulations.div_ceil(SIMULATION_BATCH_SIZE);
        let progress_every = (num_batches / 10).max(1);
        let completed = AtomicUsize::new(0);

        info!(
            "Running {} trials x {} days over {} assets (seed {})",
            self.num_simulations,
            self.num_days,
            models.len(),
            self.seed
        );

        let batches: Option<Vec<Vec<f64>>> = (0..num_batches)
            .into_par_iter()
            .map(|batch| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let start = batch * SIMULATION_BATCH_SIZE;
                let end = (start + SIMULATION_BATCH_SIZE).min(self.num_simulations);
                let terminal: Vec<f64> = (start..end)
                    .map(|trial| self.run_trial(&prepared, trial, |_| {}))
                    .collect();
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % progress_every == 0 {
                    debug!("Monte Carlo progress: {}/{} batches", done, num_batches);
                }
                Some(terminal)
            })
            .collect();

        let Some(batches) = batches else {
            return Err(SimulationError::Cancelled {
                completed_batches: completed.load(Ordering::Relaxed),
            });
        };

        Ok(SimulationOutcome {
            terminal_values: batches.into_iter().flatten().collect(),
            seed: self.seed,
        })
    }

    /// Per-day asset values of a single trial; row `d` holds the values after day `d + 1`.
    pub fn trial_path(
        &self,
        models: &[AssetModel],
        factor: &CovarianceFactor,
        trial: usize,
    ) -> Result<Vec<Vec<f64>>, SimulationError> {
        let prepared = self.prepare(models, factor)?;
        let mut path = Vec::with_capacity(self.num_days);
        self.run_trial(&prepared, trial, |values| path.push(values.to_vec()));
        Ok(path)
    }
}
