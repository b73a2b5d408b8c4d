use crate::distribution::Family;
use crate::error::RiskError;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

// ── Analysis defaults ───────────────────────────────────────────────────────

/// Confidence level used for VaR / CVaR when none is configured.
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

/// Number of Monte Carlo trials per analysis.
pub const DEFAULT_NUM_SIMULATIONS: usize = 10_000;

/// Risk horizon in trading days (one week).
pub const DEFAULT_NUM_DAYS: usize = 7;

/// Histogram bins used by the chi-square goodness-of-fit statistic.
pub const DEFAULT_HISTOGRAM_BINS: usize = 20;

/// GARCH(1,1) is only attempted on series strictly longer than this.
pub const GARCH_MIN_OBSERVATIONS: usize = 30;

/// Fraction of the fully-overlapping window a pair must share to get a correlation.
pub const MIN_PAIR_OVERLAP_FRACTION: f64 = 0.8;

/// Added to expected bin counts so empty bins don't divide by zero.
pub const CHI_SQUARE_EPSILON: f64 = 1e-8;

/// Trials handed to a worker between two cancellation checks.
pub const SIMULATION_BATCH_SIZE: usize = 256;

/// Days of daily history requested from the market-data source.
pub const HISTORY_DAYS: usize = 360;

/// Grams per troy ounce, for converting XAU/USD into gram gold in TL.
pub const TROY_OUNCE_GRAMS: f64 = 31.1035;

/// Assets the ledger may hold that carry market risk (TL cash is excluded).
pub const RISK_ASSET_KEYS: &[&str] = &["USD", "EUR", "Gold_Gram_TL"];

// ── Environment keys ────────────────────────────────────────────────────────

pub const ENV_CONFIDENCE: &str = "WALLET_RISK_CONFIDENCE";
pub const ENV_SIMULATIONS: &str = "WALLET_RISK_SIMULATIONS";
pub const ENV_DAYS: &str = "WALLET_RISK_DAYS";
pub const ENV_BINS: &str = "WALLET_RISK_HISTOGRAM_BINS";
pub const ENV_SEED: &str = "WALLET_RISK_SEED";
pub const ENV_VOLATILITY_MODEL: &str = "WALLET_RISK_VOLATILITY_MODEL";
pub const ENV_THREADS: &str = "WALLET_RISK_THREADS";

/// Builds the global rayon pool used by the Monte Carlo stage.
///
/// `WALLET_RISK_THREADS` caps the worker count; otherwise every logical core is used.
pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = std::env::var(ENV_THREADS)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get)
            .max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!("Initialized Rayon thread pool with {} threads", num_threads),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityModel {
    /// GARCH(1,1) conditional volatility, falling back to the sample estimator.
    Garch,
    /// Plain sample standard deviation of log returns.
    Sample,
}

impl VolatilityModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Garch => "garch",
            Self::Sample => "sample",
        }
    }
}

impl FromStr for VolatilityModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "garch" | "conditional" => Ok(Self::Garch),
            "sample" | "stddev" | "sample_stddev" => Ok(Self::Sample),
            other => Err(format!("unknown volatility model '{}'", other)),
        }
    }
}

/// Recognised options of one risk-analysis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub confidence_level: f64,
    pub num_simulations: usize,
    pub num_days: usize,
    pub families: Vec<Family>,
    pub histogram_bins: usize,
    /// Run-level seed; a random one is drawn (and reported) when absent.
    pub seed: Option<u64>,
    pub volatility_model: VolatilityModel,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            num_simulations: DEFAULT_NUM_SIMULATIONS,
            num_days: DEFAULT_NUM_DAYS,
            families: Family::ALL.to_vec(),
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
            seed: None,
            volatility_model: VolatilityModel::Garch,
        }
    }
}

impl RiskConfig {
    /// Defaults overridden by `WALLET_RISK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RiskConfig::from_env`] with an injectable variable source.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parse_var::<f64>(&lookup, ENV_CONFIDENCE) {
            cfg.confidence_level = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_SIMULATIONS) {
            cfg.num_simulations = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_DAYS) {
            cfg.num_days = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_BINS) {
            cfg.histogram_bins = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_SEED) {
            cfg.seed = Some(v);
        }
        if let Some(v) = parse_var::<VolatilityModel>(&lookup, ENV_VOLATILITY_MODEL) {
            cfg.volatility_model = v;
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), RiskError> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(RiskError::config(format!(
                "Confidence level must lie strictly between 0 and 1, got {}",
                self.confidence_level
            )));
        }
        if self.num_simulations == 0 {
            return Err(RiskError::config("Number of simulations must be at least 1"));
        }
        if self.num_days == 0 {
            return Err(RiskError::config("Simulation horizon must be at least 1 day"));
        }
        if self.histogram_bins == 0 {
            return Err(RiskError::config("Histogram bin count must be at least 1"));
        }
        if self.families.is_empty() {
            return Err(RiskError::config("At least one candidate distribution family is required"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={} ; value could not be parsed", key, trimmed);
            None
        }
    }
}
