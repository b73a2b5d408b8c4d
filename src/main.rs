use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_risk::config::{self, RiskConfig, VolatilityModel};
use wallet_risk::distribution::Family;
use wallet_risk::market::{AwesomeApiSource, JsonFileSource};
use wallet_risk::portfolio::{self, Wallet};
use wallet_risk::simulation::CancellationToken;
use wallet_risk::volatility::estimator_for;
use wallet_risk::{run_with_source, RiskError, RiskReport};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "wallet-risk: Monte Carlo VaR / CVaR for a TL wallet of USD, EUR and gram gold",
    group(ArgGroup::new("source").required(true).args(["history", "live"])),
    after_help = "EXAMPLES:
    # Offline analysis from a saved history file
    cargo run --release -- --wallet wallet.json --history history.json

    # Live AwesomeAPI quotes, 99% confidence, reproducible run
    cargo run --release -- --wallet wallet.json --live --confidence 0.99 --seed 42

    # Machine-readable output
    cargo run --release -- --wallet wallet.json --history history.json --json"
)]
struct Args {
    /// Wallet JSON file mapping asset keys (TL, USD, EUR, Gold_Gram_TL) to current TL values
    #[arg(long)]
    wallet: PathBuf,

    /// Price history JSON file: {"order": "newest_first" | "oldest_first", "series": {...}}
    #[arg(long)]
    history: Option<PathBuf>,

    /// Fetch daily quotes from AwesomeAPI instead of a file
    #[arg(long)]
    live: bool,

    /// Confidence level for VaR / CVaR (default: 0.95)
    #[arg(long)]
    confidence: Option<f64>,

    /// Number of Monte Carlo trials (default: 10000)
    #[arg(long)]
    simulations: Option<usize>,

    /// Horizon in days (default: 7)
    #[arg(long)]
    days: Option<usize>,

    /// Run seed; a random one is drawn and reported when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Histogram bins for the chi-square fit statistic (default: 20)
    #[arg(long)]
    bins: Option<usize>,

    /// Volatility model (default: garch)
    #[arg(long, value_enum)]
    volatility_model: Option<VolatilityModel>,

    /// Candidate return distributions, comma-separated (default: normal,student-t,laplace)
    #[arg(long, value_enum, value_delimiter = ',')]
    families: Option<Vec<Family>>,

    /// Print the report (or error) as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Environment-derived config with command-line flags applied on top.
    fn risk_config(&self) -> RiskConfig {
        let mut cfg = RiskConfig::from_env();
        if let Some(v) = self.confidence {
            cfg.confidence_level = v;
        }
        if let Some(v) = self.simulations {
            cfg.num_simulations = v;
        }
        if let Some(v) = self.days {
            cfg.num_days = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = Some(v);
        }
        if let Some(v) = self.bins {
            cfg.histogram_bins = v;
        }
        if let Some(v) = self.volatility_model {
            cfg.volatility_model = v;
        }
        if let Some(ref v) = self.families {
            cfg.families = v.clone();
        }
        cfg
    }
}

fn emit(result: &Result<RiskReport, RiskError>, json: bool) -> ExitCode {
    match (result, json) {
        (Ok(report), true) => match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                error!("Failed to serialise report: {}", e);
                return ExitCode::FAILURE;
            }
        },
        (Ok(report), false) => portfolio::print_report(report),
        (Err(e), true) => {
            let body = serde_json::to_string_pretty(e).unwrap_or_else(|_| format!("{{\"error\": {:?}}}", e.to_string()));
            println!("{}", body);
        }
        (Err(e), false) => error!("Risk analysis failed: {}", e),
    }
    if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wallet_risk=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    config::init_cpu_parallelism();
    let args = Args::parse();
    let cfg = args.risk_config();

    let wallet = match Wallet::load(&args.wallet) {
        Ok(w) => w,
        Err(e) => {
            let err = RiskError::config(format!("{:#}", e));
            return emit(&Err(err), args.json);
        }
    };
    let values = wallet.risk_values();
    info!(
        "Wallet total {:.2} TL, {:.2} TL exposed to market risk",
        wallet.total_value(),
        values.values().sum::<f64>()
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling simulation");
                cancel.cancel();
            }
        });
    }

    let estimator = estimator_for(cfg.volatility_model);
    let result = if args.live {
        run_with_source(&AwesomeApiSource::from_env(), values, cfg, estimator, cancel).await
    } else if let Some(ref path) = args.history {
        run_with_source(&JsonFileSource::new(path), values, cfg, estimator, cancel).await
    } else {
        Err(RiskError::config("either --history or --live is required"))
    };

    emit(&result, args.json)
}
