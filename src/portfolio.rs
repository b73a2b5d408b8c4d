use crate::analysis::RiskReport;
use crate::config::RISK_ASSET_KEYS;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Wallet
// ──────────────────────────────────────────────────────────────────────────────

/// Current TL value of each holding, keyed by asset (`TL`, `USD`, `EUR`, `Gold_Gram_TL`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wallet {
    pub holdings: BTreeMap<String, f64>,
}

impl Wallet {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let wallet: Wallet = serde_json::from_str(raw).context("parsing wallet JSON")?;
        wallet.validate()?;
        Ok(wallet)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading wallet {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        for (asset, value) in &self.holdings {
            if !value.is_finite() || *value < 0.0 {
                return Err(anyhow!("wallet value for {} must be a non-negative number, got {}", asset, value));
            }
        }
        Ok(())
    }

    /// Everything in the wallet, cash included.
    pub fn total_value(&self) -> f64 {
        self.holdings.values().sum()
    }

    /// Holdings that carry market risk. TL cash, unknown keys and empty positions are left out.
    pub fn risk_values(&self) -> BTreeMap<String, f64> {
        self.holdings
            .iter()
            .filter(|(asset, value)| {
                let known = RISK_ASSET_KEYS.contains(&asset.as_str());
                if !known {
                    if asset.as_str() == "TL" {
                        debug!("TL cash carries no market risk; excluded from analysis");
                    } else {
                        warn!("Unknown wallet asset '{}' ignored", asset);
                    }
                    return false;
                }
                if **value <= 0.0 {
                    debug!("{}: no holding; excluded from analysis", asset);
                    return false;
                }
                true
            })
            .map(|(asset, value)| (asset.clone(), *value))
            .collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Report printer
// ──────────────────────────────────────────────────────────────────────────────

/// Pretty-prints a risk report to stdout.
pub fn print_report(report: &RiskReport) {
    let pct = (report.confidence_level * 100.0).round();
    let diag = &report.diagnostics;

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                 Wallet Risk Analysis                       ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Portfolio Value (TL)   : {:>14.2}                   ║", report.initial_value);
    println!("║  VaR  {:>3.0}% ({:>2}-day)     : {:>14.2}                   ║", pct, diag.num_days, report.value_at_risk);
    if report.tail_size == 0 {
        println!("║  CVaR {:>3.0}% ({:>2}-day)     : {:>14}                   ║", pct, diag.num_days, "undefined");
    } else {
        println!("║  CVaR {:>3.0}% ({:>2}-day)     : {:>14.2}                   ║", pct, diag.num_days, report.conditional_value_at_risk);
    }
    println!("║  Trials / Seed          : {:>7} / {:<20}   ║", diag.num_simulations, diag.seed);
    println!("║  Correlation            : {:<32} ║", format!("{:?}", diag.factor_mode).to_lowercase());
    println!("║  Volatility Source      : {:<32} ║", diag.volatility_source.as_str());
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Asset          Value (TL)     Drift    Vol.   Dist.      ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    for ranked in &report.risk_ranking {
        if let Some(a) = diag.assets.iter().find(|a| a.asset == ranked.asset) {
            let family = a
                .distribution
                .as_ref()
                .map(|d| d.family().as_str())
                .unwrap_or("-");
            println!(
                "║  {:<13} {:>11.2}  {:>+8.5}  {:>6.4}  {:<10} ║",
                a.asset, a.initial_value, a.drift, a.volatility, family
            );
        }
    }
    for asset in &diag.unmodelled_assets {
        println!("║  {:<13} {:>11}  (no usable history, held constant)  ║", asset, "");
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║                      Suggestions                           ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Increase : {:<46} ║", report.suggestions.increase.join(", "));
    println!("║  Decrease : {:<46} ║", report.suggestions.decrease.join(", "));
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
