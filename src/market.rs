use crate::config::{HISTORY_DAYS, TROY_OUNCE_GRAMS};
use crate::returns::{PriceSeries, SeriesOrder};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const AWESOME_API_BASE_URL: &str = "https://economia.awesomeapi.com.br";
pub const ENV_AWESOME_API_URL: &str = "WALLET_RISK_AWESOME_API_URL";

const FETCH_ATTEMPTS: usize = 3;
const FETCH_TIMEOUT_SECS: u64 = 15;

/// Something that can deliver daily price histories for wallet assets.
pub trait PriceHistorySource {
    fn name(&self) -> &str;

    /// One series per requested asset, in request order. An asset the source
    /// cannot serve comes back as an empty series.
    fn fetch_histories(&self, assets: &[String]) -> impl Future<Output = Result<Vec<PriceSeries>>> + Send;
}

// ──────────────────────────────────────────────────────────────────────────────
// Offline history file
// ──────────────────────────────────────────────────────────────────────────────

/// On-disk history: one ordering tag for every series in the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryFile {
    pub order: SeriesOrder,
    pub series: BTreeMap<String, Vec<f64>>,
}

impl HistoryFile {
    pub fn to_series(&self, assets: &[String]) -> Vec<PriceSeries> {
        assets
            .iter()
            .map(|asset| {
                let prices = self.series.get(asset).cloned().unwrap_or_else(|| {
                    warn!("{}: no price history in file", asset);
                    Vec::new()
                });
                PriceSeries::new(asset.clone(), prices, self.order)
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PriceHistorySource for JsonFileSource {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn fetch_histories(&self, assets: &[String]) -> Result<Vec<PriceSeries>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading price history {}", self.path.display()))?;
        let file: HistoryFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing price history {}", self.path.display()))?;
        info!(
            "Loaded {} price series from {} ({:?})",
            file.series.len(),
            self.path.display(),
            file.order
        );
        Ok(file.to_series(assets))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// AwesomeAPI daily quotes
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DailyQuote {
    bid: Option<String>,
}

/// Daily bid quotes from AwesomeAPI, newest first.
#[derive(Clone, Debug)]
pub struct AwesomeApiSource {
    client: reqwest::Client,
    base_url: String,
    days: usize,
}

impl Default for AwesomeApiSource {
    fn default() -> Self {
        Self::new(AWESOME_API_BASE_URL, HISTORY_DAYS)
    }
}

impl AwesomeApiSource {
    pub fn new(base_url: impl Into<String>, days: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            days,
        }
    }

    /// Base URL from `WALLET_RISK_AWESOME_API_URL`, else the public endpoint.
    pub fn from_env() -> Self {
        let base = std::env::var(ENV_AWESOME_API_URL)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| AWESOME_API_BASE_URL.to_string());
        Self::new(base, HISTORY_DAYS)
    }

    fn daily_url(&self, pair: &str) -> String {
        format!("{}/json/daily/{}/{}", self.base_url, pair, self.days)
    }

    async fn fetch_pair(&self, pair: &str) -> Result<Vec<f64>> {
        let url = self.daily_url(pair);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=FETCH_ATTEMPTS {
            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .send()
                .await
            {
                Ok(resp) => match resp.error_for_status() {
                    Ok(ok_resp) => match ok_resp.json::<Vec<DailyQuote>>().await {
                        Ok(quotes) => return Ok(parse_bids(pair, &quotes)),
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            }

            if attempt < FETCH_ATTEMPTS {
                warn!("AwesomeAPI fetch retry for {} ({}/{})", pair, attempt, FETCH_ATTEMPTS);
                retry_sleep(attempt).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("AwesomeAPI fetch failed for {}", pair)))
    }

    async fn fetch_or_empty(&self, pair: &str, needed: bool, failures: &mut Vec<String>) -> Vec<f64> {
        if !needed {
            return Vec::new();
        }
        match self.fetch_pair(pair).await {
            Ok(prices) => {
                debug!("{}: {} daily bids", pair, prices.len());
                prices
            }
            Err(e) => {
                warn!("{}: history unavailable ({})", pair, e);
                failures.push(format!("{}: {}", pair, e));
                Vec::new()
            }
        }
    }
}

async fn retry_sleep(attempt: usize) {
    let millis = (250_u64 * attempt as u64).min(1500);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn parse_bids(pair: &str, quotes: &[DailyQuote]) -> Vec<f64> {
    quotes
        .iter()
        .filter_map(|q| {
            let raw = q.bid.as_deref()?;
            match raw.trim().parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("{}: skipping non-numeric bid '{}'", pair, raw);
                    None
                }
            }
        })
        .collect()
}

/// Gram gold in TL from XAU/USD and USD/TRY series of equal length, rounded to kuruş.
pub fn gram_gold_try(xau_usd: &[f64], usd_try: &[f64]) -> Vec<f64> {
    if xau_usd.is_empty() || xau_usd.len() != usd_try.len() {
        if !xau_usd.is_empty() || !usd_try.is_empty() {
            warn!(
                "Gold_Gram_TL: XAU-USD ({}) and USD-TRY ({}) lengths differ; gold history unavailable",
                xau_usd.len(),
                usd_try.len()
            );
        }
        return Vec::new();
    }
    xau_usd
        .iter()
        .zip(usd_try)
        .map(|(xau, usd)| (xau * usd / TROY_OUNCE_GRAMS * 100.0).round() / 100.0)
        .collect()
}

impl PriceHistorySource for AwesomeApiSource {
    fn name(&self) -> &str {
        "awesomeapi"
    }

    async fn fetch_histories(&self, assets: &[String]) -> Result<Vec<PriceSeries>> {
        let wants = |key: &str| assets.iter().any(|a| a == key);
        let needs_usd = wants("USD") || wants("Gold_Gram_TL");

        let mut failures = Vec::new();
        let usd_try = self.fetch_or_empty("USD-TRY", needs_usd, &mut failures).await;
        let eur_try = self.fetch_or_empty("EUR-TRY", wants("EUR"), &mut failures).await;
        let xau_usd = self.fetch_or_empty("XAU-USD", wants("Gold_Gram_TL"), &mut failures).await;

        let series: Vec<PriceSeries> = assets
            .iter()
            .map(|asset| {
                let prices = match asset.as_str() {
                    "USD" => usd_try.clone(),
                    "EUR" => eur_try.clone(),
                    "Gold_Gram_TL" => gram_gold_try(&xau_usd, &usd_try),
                    other => {
                        warn!("{}: not served by AwesomeAPI", other);
                        Vec::new()
                    }
                };
                PriceSeries::new(asset.clone(), prices, SeriesOrder::NewestFirst)
            })
            .collect();

        if !failures.is_empty() && series.iter().all(PriceSeries::is_empty) {
            return Err(anyhow!("market data fetch failed ({})", failures.join("; ")));
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn assets(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_json_file_source_keeps_order_tag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"order": "newest_first", "series": {{"USD": [34.2, 34.0, 33.9], "EUR": [37.1, 37.0]}}}}"#
        )
        .unwrap();

        let source = JsonFileSource::new(file.path());
        let series = source
            .fetch_histories(&assets(&["USD", "EUR", "Gold_Gram_TL"]))
            .await
            .unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].order, SeriesOrder::NewestFirst);
        assert_eq!(series[0].chronological(), vec![33.9, 34.0, 34.2]);
        assert_eq!(series[1].prices, vec![37.1, 37.0]);
        assert!(series[2].is_empty());
    }

    #[tokio::test]
    async fn test_history_file_requires_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"series": {{"USD": [1.0, 2.0]}}}}"#).unwrap();
        let err = JsonFileSource::new(file.path())
            .fetch_histories(&assets(&["USD"]))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("order"));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = JsonFileSource::new("/nonexistent/wallet-risk-history.json");
        assert!(source.fetch_histories(&assets(&["USD"])).await.is_err());
    }

    #[test]
    fn test_gram_gold_conversion() {
        let gold = gram_gold_try(&[2000.0, 2010.0], &[32.0, 32.5]);
        assert_eq!(gold, vec![2057.65, 2100.25]);
        assert!(gram_gold_try(&[2000.0], &[32.0, 32.5]).is_empty());
        assert!(gram_gold_try(&[], &[]).is_empty());
    }

    #[test]
    fn test_bid_parsing_skips_bad_values() {
        let quotes = vec![
            DailyQuote { bid: Some("34.25".into()) },
            DailyQuote { bid: Some("n/a".into()) },
            DailyQuote { bid: None },
            DailyQuote { bid: Some(" 34.10 ".into()) },
        ];
        assert_eq!(parse_bids("USD-TRY", &quotes), vec![34.25, 34.10]);
    }

    #[test]
    fn test_daily_url() {
        let source = AwesomeApiSource::new("http://localhost:8080/", 360);
        assert_eq!(source.daily_url("USD-TRY"), "http://localhost:8080/json/daily/USD-TRY/360");
    }
}
