//! zonebreak CLI: live monitor, backtests and candle downloads.
//!
//! Commands:
//! - `monitor` runs the scanner and monitor pool until Ctrl-C
//! - `backtest` replays cached/downloaded 5-minute candles and writes artifacts
//! - `fetch` downloads candles into the CSV cache

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zonebreak_core::config::Settings;
use zonebreak_core::data::{resolve_universe, BinanceKlineFeed, CircuitBreaker, CsvCandleCache, MarketDataFeed};
use zonebreak_core::domain::Timeframe;
use zonebreak_core::gateway::{BinanceFuturesGateway, ExecutionGateway, PaperGateway, RetryingGateway};
use zonebreak_runner::{
    load_candles, render_summary, run_loaded, save_artifacts, BacktestConfig, LoadOptions, Monitor,
};

#[derive(Parser)]
#[command(name = "zonebreak", about = "Zone-breakout scanner and backtester for USDT-M futures")]
struct Cli {
    /// TOML settings file, layered under env.txt/.env and the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the universe and manage positions until interrupted.
    Monitor {
        /// Trade the top N USDT pairs by 24h quote volume.
        #[arg(long)]
        universe_n: Option<usize>,

        /// Maximum simultaneous positions.
        #[arg(long)]
        max_positions: Option<usize>,

        /// Monitor tick interval in seconds.
        #[arg(long)]
        interval: Option<u64>,

        /// Explicit symbols (ignored when --universe-n is given).
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,
    },
    /// Replay 5-minute candles through the same decision logic.
    Backtest {
        #[arg(long)]
        universe_n: Option<usize>,

        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,

        /// Start (YYYY-MM-DD or RFC 3339), inclusive.
        #[arg(long)]
        start: String,

        /// End (YYYY-MM-DD or RFC 3339), exclusive.
        #[arg(long)]
        end: String,

        /// Artifact directory. Defaults to EXPORT_DIR.
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Fall back to seeded synthetic candles when no data is available.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Download candles into the CSV cache.
    Fetch {
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,

        #[arg(long)]
        universe_n: Option<usize>,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Candle interval code (5m, 1h, 4h, 1d, 1w, 1M).
        #[arg(long, default_value = "5m")]
        interval: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    init_logging(&settings.app_log_level);

    match cli.command {
        Commands::Monitor {
            universe_n,
            max_positions,
            interval,
            symbols,
        } => {
            let mut settings = settings;
            apply_universe(&mut settings, universe_n, symbols);
            if let Some(max) = max_positions {
                settings.risk.max_positions = max;
            }
            if let Some(secs) = interval {
                settings.monitor_interval_seconds = secs;
            }
            run_monitor(settings)
        }
        Commands::Backtest {
            universe_n,
            symbols,
            start,
            end,
            export_dir,
            synthetic,
        } => {
            let mut settings = settings;
            apply_universe(&mut settings, universe_n, symbols);
            if let Some(dir) = export_dir {
                settings.export_dir = dir;
            }
            run_backtest_cmd(&settings, parse_time(&start)?, parse_time(&end)?, synthetic)
        }
        Commands::Fetch {
            symbols,
            universe_n,
            start,
            end,
            interval,
        } => {
            let mut settings = settings;
            apply_universe(&mut settings, universe_n, symbols);
            let timeframe =
                Timeframe::from_code(&interval).with_context(|| format!("unknown interval '{interval}'"))?;
            run_fetch(&settings, parse_time(&start)?, parse_time(&end)?, timeframe)
        }
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn apply_universe(settings: &mut Settings, universe_n: Option<usize>, symbols: Vec<String>) {
    if universe_n.is_some() {
        settings.universe_n = universe_n;
    }
    if !symbols.is_empty() {
        settings.symbols = symbols;
    }
}

/// `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{raw}', expected YYYY-MM-DD or RFC 3339"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("invalid date '{raw}'"))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn kline_feed(base_url: &str) -> Result<BinanceKlineFeed> {
    let breaker = Arc::new(CircuitBreaker::default_exchange());
    BinanceKlineFeed::new(base_url, breaker).context("failed to build market data client")
}

fn run_monitor(settings: Settings) -> Result<()> {
    settings.validate().context("invalid settings")?;
    settings.require_credentials()?;

    let feed: Arc<dyn MarketDataFeed> = Arc::new(kline_feed(settings.exchange_url())?);
    let gateway: Arc<dyn ExecutionGateway> = if settings.dry_run {
        info!(balance = settings.initial_balance, "dry run: orders go to the paper gateway");
        Arc::new(PaperGateway::new(settings.initial_balance))
    } else {
        let (key, secret) = settings.api_credentials();
        let live = BinanceFuturesGateway::new(settings.exchange_url(), key, secret)
            .context("failed to build exchange client")?;
        warn!(testnet = settings.use_testnet, "live order routing enabled");
        Arc::new(RetryingGateway::new(live, settings.retry_policy()))
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping after the current cycle");
        interrupted.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let monitor = Monitor::start(settings, feed, gateway, shutdown)?;
    monitor.join();
    Ok(())
}

fn run_backtest_cmd(settings: &Settings, start: DateTime<Utc>, end: DateTime<Utc>, synthetic: bool) -> Result<()> {
    if start >= end {
        bail!("--start must be before --end");
    }
    let config = BacktestConfig::from_settings(settings)?;
    let cache = CsvCandleCache::new(&settings.data_dir);

    let feed = match kline_feed(&settings.binance_base_url) {
        Ok(feed) => Some(feed),
        Err(e) => {
            warn!(error = %e, "continuing without a market data feed");
            None
        }
    };
    let feed_ref: Option<&dyn MarketDataFeed> = feed.as_ref().map(|f| f as &dyn MarketDataFeed);

    let symbols = resolve_universe(&settings.symbols, settings.universe_n, feed_ref)
        .context("failed to resolve the symbol universe")?;
    let opts = LoadOptions {
        start,
        end,
        synthetic,
        force: false,
    };
    let loaded = load_candles(&symbols, &cache, feed_ref, &opts)?;
    let report = run_loaded(&loaded, &config)?;

    print!("{}", render_summary(&report));
    let dir = save_artifacts(&report, &settings.export_dir)?;
    println!("Artifacts saved to: {}", dir.display());
    Ok(())
}

fn run_fetch(settings: &Settings, start: DateTime<Utc>, end: DateTime<Utc>, timeframe: Timeframe) -> Result<()> {
    if start >= end {
        bail!("--start must be before --end");
    }
    let feed = kline_feed(&settings.binance_base_url)?;
    let cache = CsvCandleCache::new(&settings.data_dir);
    let symbols = resolve_universe(&settings.symbols, settings.universe_n, Some(&feed))
        .context("failed to resolve the symbol universe")?;

    let mut failed = 0usize;
    for symbol in &symbols {
        match feed.get_candles(symbol, timeframe, start, end) {
            Ok(candles) => {
                let total = cache
                    .write(symbol, timeframe, &candles)
                    .with_context(|| format!("failed to cache {symbol}"))?;
                println!("{symbol:<12} {:>7} fetched {:>8} cached", candles.len(), total);
            }
            Err(e) => {
                failed += 1;
                eprintln!("{symbol:<12} error: {e}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} symbols failed", symbols.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_parse_as_utc_midnight() {
        assert_eq!(
            parse_time("2024-03-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("2024-03-01T12:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap()
        );
        assert!(parse_time("03/01/2024").is_err());
    }

    #[test]
    fn backtest_args_parse() {
        let cli = Cli::try_parse_from([
            "zonebreak",
            "backtest",
            "--symbols",
            "BTCUSDT",
            "ETHUSDT",
            "--start",
            "2024-01-01",
            "--end",
            "2024-02-01",
            "--synthetic",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest { symbols, synthetic, .. } => {
                assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
                assert!(synthetic);
            }
            _ => panic!("expected backtest"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["zonebreak", "monitor", "--config", "bot.toml", "--max-positions", "2"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));
        assert!(matches!(cli.command, Commands::Monitor { max_positions: Some(2), .. }));
    }

    #[test]
    fn universe_flags_override_settings() {
        let mut settings = Settings::default();
        apply_universe(&mut settings, Some(5), vec!["SOLUSDT".into()]);
        assert_eq!(settings.universe_n, Some(5));
        assert_eq!(settings.symbols, vec!["SOLUSDT"]);

        let mut untouched = Settings::default();
        apply_universe(&mut untouched, None, Vec::new());
        assert_eq!(untouched.universe_n, None);
        assert!(untouched.symbols.is_empty());
    }
}
