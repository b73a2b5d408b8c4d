pub mod analysis;
pub mod config;
pub mod correlation;
pub mod distribution;
pub mod error;
pub mod market;
pub mod metrics;
pub mod portfolio;
pub mod returns;
pub mod simulation;
pub mod volatility;

pub use analysis::{analyze, run_analysis, run_with_source, RiskReport};
pub use config::{RiskConfig, VolatilityModel};
pub use error::RiskError;
pub use portfolio::Wallet;
