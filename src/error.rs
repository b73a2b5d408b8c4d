use serde::{Serialize, Serializer};
use thiserror::Error;

/// Terminal failure of a risk-analysis request.
///
/// Every variant carries one human-readable reason. Per-asset numerical
/// problems never show up here; they are absorbed by the stage that hit them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    /// Empty wallet, non-positive value or an out-of-range parameter.
    #[error("{0}")]
    Config(String),
    /// Missing, too-short or misaligned price history that left nothing to analyse.
    #[error("{0}")]
    Data(String),
    /// A numerical stage produced nothing usable for any asset.
    #[error("{0}")]
    Numeric(String),
}

impl RiskError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub fn data(reason: impl Into<String>) -> Self {
        Self::Data(reason.into())
    }

    pub fn numeric(reason: impl Into<String>) -> Self {
        Self::Numeric(reason.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Data(_) => "data",
            Self::Numeric(_) => "numeric",
        }
    }
}

impl Serialize for RiskError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("error", &self.to_string())?;
        map.serialize_entry("kind", self.kind())?;
        map.end()
    }
}

/// Why a single distribution candidate could not be fitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error("series has zero dispersion")]
    ZeroDispersion,
    #[error("non-finite parameter estimate: {0}")]
    NonFinite(&'static str),
    #[error("invalid distribution parameters: {0}")]
    InvalidParameters(String),
}

/// Why a conditional volatility estimate is unavailable for one asset.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VolatilityFitError {
    #[error("need more than {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error("likelihood optimisation did not find a finite optimum")]
    NoFiniteOptimum,
    #[error("estimated volatility {0} is not positive")]
    NonPositive(f64),
}

/// Why the covariance matrix could not be factorised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactorizationError {
    #[error("covariance matrix has undefined entries")]
    Undefined,
    #[error("covariance matrix is not positive definite")]
    NotPositiveDefinite,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error("no assets to simulate")]
    NoAssets,
    #[error("factor is {rows}x{cols} but {assets} assets were supplied")]
    DimensionMismatch {
        rows: usize,
        cols: usize,
        assets: usize,
    },
    #[error("simulation cancelled after {completed_batches} batches")]
    Cancelled { completed_batches: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_as_reason_object() {
        let err = RiskError::config("Portfolio value must be positive");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "Portfolio value must be positive");
        assert_eq!(json["kind"], "config");
    }

    #[test]
    fn test_display_is_the_bare_reason() {
        let err = RiskError::data("no history");
        assert_eq!(err.to_string(), "no history");
    }
}
