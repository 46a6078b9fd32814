//! Runtime settings.
//!
//! Built once at startup and shared read-only. Layers, lowest first:
//! defaults, an optional TOML file, `env.txt` / `.env` (via dotenvy, never
//! overriding the real environment), then process environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::data::default_symbols;
use crate::domain::Timeframe;
use crate::gateway::binance::{LIVE_URL, TESTNET_URL};
use crate::gateway::RetryPolicy;
use crate::risk::RiskParams;
use crate::zones::ZoneParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{key}='{value}' is not a valid value")]
    InvalidValue { key: String, value: String },

    #[error("{key} out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },

    #[error("live trading on {network} needs {key_var} and {secret_var}")]
    MissingCredentials {
        network: &'static str,
        key_var: &'static str,
        secret_var: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub use_testnet: bool,
    pub dry_run: bool,
    pub clear_orphan_positions: bool,

    #[serde(skip_serializing)]
    pub binance_api_key: String,
    #[serde(skip_serializing)]
    pub binance_api_secret: String,
    #[serde(skip_serializing)]
    pub binance_testnet_api_key: String,
    #[serde(skip_serializing)]
    pub binance_testnet_api_secret: String,
    pub binance_base_url: String,
    pub binance_testnet_url: String,

    /// Explicit universe; empty means the built-in default list.
    pub symbols: Vec<String>,
    pub universe_n: Option<usize>,

    pub max_monitor_pool_size: usize,
    pub monitor_interval_seconds: u64,
    pub global_scan_interval_seconds: u64,
    pub pool_demote_after_scans: usize,
    /// Defaults to `max_monitor_pool_size`.
    pub worker_threads: Option<usize>,
    /// 5m candles fetched when a symbol is first seen.
    pub history_bars: usize,

    /// Interval codes, coarsest first.
    pub trend_ladder: Vec<String>,
    pub trend_slope_lookback: usize,

    pub zones: ZoneParams,
    pub risk: RiskParams,

    pub taker_fee_bps: f64,
    pub slippage_bps: f64,
    pub initial_balance: f64,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub app_log_level: String,
    pub data_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_testnet: true,
            dry_run: true,
            clear_orphan_positions: true,
            binance_api_key: String::new(),
            binance_api_secret: String::new(),
            binance_testnet_api_key: String::new(),
            binance_testnet_api_secret: String::new(),
            binance_base_url: LIVE_URL.to_string(),
            binance_testnet_url: TESTNET_URL.to_string(),
            symbols: Vec::new(),
            universe_n: None,
            max_monitor_pool_size: 8,
            monitor_interval_seconds: 15,
            global_scan_interval_seconds: 30,
            pool_demote_after_scans: 2,
            worker_threads: None,
            history_bars: 300,
            trend_ladder: ["1M", "1W", "1D", "1h"].iter().map(|s| s.to_string()).collect(),
            trend_slope_lookback: 1,
            zones: ZoneParams::default(),
            risk: RiskParams::default(),
            taker_fee_bps: 10.0,
            slippage_bps: 2.0,
            initial_balance: 10_000.0,
            retry_max_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            app_log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            export_dir: PathBuf::from("exports"),
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_as<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn ensure(ok: bool, key: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            reason: reason.into(),
        })
    }
}

impl Settings {
    /// Defaults, then `toml_path`, then dotenv files, then the environment.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match toml_path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        for file in ["env.txt", ".env"] {
            if dotenvy::from_filename(file).is_ok() {
                debug!(file, "loaded dotenv file");
            }
        }
        settings.apply_env(|k| std::env::var(k).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Overlay every recognized variable `lookup` returns.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        macro_rules! overlay {
            ($key:literal, $slot:expr, bool) => {
                if let Some(v) = get($key) {
                    $slot = parse_bool($key, &v)?;
                }
            };
            ($key:literal, $slot:expr, string) => {
                if let Some(v) = get($key) {
                    $slot = v.trim().to_string();
                }
            };
            ($key:literal, $slot:expr) => {
                if let Some(v) = get($key) {
                    $slot = parse_as($key, &v)?;
                }
            };
        }

        overlay!("USE_TESTNET", self.use_testnet, bool);
        overlay!("DRY_RUN", self.dry_run, bool);
        overlay!("CLEAR_ORPHAN_POSITIONS", self.clear_orphan_positions, bool);

        overlay!("BINANCE_API_KEY", self.binance_api_key, string);
        overlay!("BINANCE_API_SECRET", self.binance_api_secret, string);
        overlay!("BINANCE_TESTNET_API_KEY", self.binance_testnet_api_key, string);
        overlay!("BINANCE_TESTNET_API_SECRET", self.binance_testnet_api_secret, string);
        overlay!("BINANCE_BASE_URL", self.binance_base_url, string);
        overlay!("BINANCE_TESTNET_URL", self.binance_testnet_url, string);

        if let Some(v) = get("SYMBOLS") {
            self.symbols = parse_list(&v);
        }
        if let Some(v) = get("UNIVERSE_N") {
            self.universe_n = Some(parse_as("UNIVERSE_N", &v)?);
        }

        overlay!("MAX_MONITOR_POOL_SIZE", self.max_monitor_pool_size);
        overlay!("MONITOR_INTERVAL_SECONDS", self.monitor_interval_seconds);
        overlay!("GLOBAL_SCAN_INTERVAL_SECONDS", self.global_scan_interval_seconds);
        overlay!("POOL_DEMOTE_AFTER_SCANS", self.pool_demote_after_scans);
        if let Some(v) = get("WORKER_THREADS") {
            self.worker_threads = Some(parse_as("WORKER_THREADS", &v)?);
        }
        overlay!("HISTORY_BARS", self.history_bars);

        if let Some(v) = get("TREND_LADDER") {
            self.trend_ladder = parse_list(&v);
        }
        overlay!("TREND_SLOPE_LOOKBACK", self.trend_slope_lookback);

        overlay!("DWELL_BARS", self.zones.dwell_bars);
        overlay!("TOUCH_SEPARATION_BARS", self.zones.touch_separation_bars);
        overlay!("RETEST_WINDOW_BARS", self.zones.retest_window_bars);
        overlay!("TOUCH_BUFFER_FRAC", self.zones.touch_buffer_frac);
        overlay!("BREAKOUT_BUFFER_FRAC", self.zones.breakout_buffer_frac);
        overlay!("ATR_TIGHT_MULT", self.zones.atr_tight_mult);
        overlay!("ATR_PERIOD", self.zones.atr_period);
        overlay!("ZONE_LOOKBACK_BARS", self.zones.lookback_bars);
        overlay!("ZONE_CLOSE_FRACTION", self.zones.close_fraction);
        overlay!("MIN_HISTORY_BARS", self.zones.min_history_bars);
        overlay!("ZONE_COOLDOWN_BARS", self.zones.cooldown_bars);
        overlay!("TRACKER_WINDOW_BARS", self.zones.window_bars);

        overlay!("MAX_POSITIONS", self.risk.max_positions);
        overlay!("LEVERAGE", self.risk.leverage);
        overlay!("POSITION_SIZE_PCT_TREND_ALIGNED", self.risk.pct_trend_aligned);
        overlay!("POSITION_SIZE_PCT_COUNTER_TREND", self.risk.pct_counter_trend);
        overlay!("SWING_LEFT", self.risk.swing_left);
        overlay!("SWING_RIGHT", self.risk.swing_right);
        overlay!("CAP_REJECTION_POLICY", self.risk.cap_rejection_policy);
        overlay!("TAKE_PROFIT_TARGETS", self.risk.take_profit_targets, bool);

        overlay!("TAKER_FEE_BPS", self.taker_fee_bps);
        overlay!("SLIPPAGE_BPS", self.slippage_bps);
        overlay!("INITIAL_BALANCE", self.initial_balance);

        overlay!("RETRY_MAX_ATTEMPTS", self.retry_max_attempts);
        overlay!("RETRY_BASE_DELAY_MS", self.retry_base_delay_ms);
        overlay!("RETRY_MAX_DELAY_MS", self.retry_max_delay_ms);

        overlay!("APP_LOG_LEVEL", self.app_log_level, string);
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("EXPORT_DIR") {
            self.export_dir = PathBuf::from(v.trim());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let z = &self.zones;
        let r = &self.risk;
        ensure(
            (1.0..=125.0).contains(&r.leverage),
            "LEVERAGE",
            format!("{} not in 1..=125", r.leverage),
        )?;
        for (key, pct) in [
            ("POSITION_SIZE_PCT_TREND_ALIGNED", r.pct_trend_aligned),
            ("POSITION_SIZE_PCT_COUNTER_TREND", r.pct_counter_trend),
        ] {
            ensure(pct > 0.0 && pct <= 100.0, key, format!("{pct} not in (0, 100]"))?;
        }
        ensure(r.max_positions >= 1, "MAX_POSITIONS", "must be at least 1")?;
        ensure(r.swing_left >= 1 && r.swing_right >= 1, "SWING_LEFT", "swing sides must be at least 1")?;
        ensure(self.max_monitor_pool_size >= 1, "MAX_MONITOR_POOL_SIZE", "must be at least 1")?;
        ensure(self.worker_threads() >= 1, "WORKER_THREADS", "must be at least 1")?;
        ensure(self.monitor_interval_seconds >= 1, "MONITOR_INTERVAL_SECONDS", "must be at least 1")?;
        ensure(
            self.global_scan_interval_seconds >= 1,
            "GLOBAL_SCAN_INTERVAL_SECONDS",
            "must be at least 1",
        )?;
        ensure(z.dwell_bars >= 1, "DWELL_BARS", "must be at least 1")?;
        ensure(z.retest_window_bars >= 1, "RETEST_WINDOW_BARS", "must be at least 1")?;
        ensure(z.touch_buffer_frac >= 0.0, "TOUCH_BUFFER_FRAC", "must be non-negative")?;
        ensure(
            z.breakout_buffer_frac >= z.touch_buffer_frac,
            "BREAKOUT_BUFFER_FRAC",
            "must be at least TOUCH_BUFFER_FRAC",
        )?;
        ensure(z.atr_tight_mult > 0.0, "ATR_TIGHT_MULT", "must be positive")?;
        ensure(z.atr_period >= 1, "ATR_PERIOD", "must be at least 1")?;
        ensure(z.lookback_bars >= 2, "ZONE_LOOKBACK_BARS", "must be at least 2")?;
        ensure(
            z.close_fraction > 0.0 && z.close_fraction <= 1.0,
            "ZONE_CLOSE_FRACTION",
            "must be in (0, 1]",
        )?;
        ensure(
            z.min_history_bars > z.atr_period && z.min_history_bars >= z.lookback_bars,
            "MIN_HISTORY_BARS",
            "must exceed ATR_PERIOD and cover ZONE_LOOKBACK_BARS",
        )?;
        ensure(
            z.window_bars >= z.min_history_bars,
            "TRACKER_WINDOW_BARS",
            "must be at least MIN_HISTORY_BARS",
        )?;
        ensure(
            self.history_bars >= z.min_history_bars,
            "HISTORY_BARS",
            "must be at least MIN_HISTORY_BARS",
        )?;
        ensure(self.taker_fee_bps >= 0.0, "TAKER_FEE_BPS", "must be non-negative")?;
        ensure(self.slippage_bps >= 0.0, "SLIPPAGE_BPS", "must be non-negative")?;
        ensure(self.initial_balance > 0.0, "INITIAL_BALANCE", "must be positive")?;
        ensure(self.retry_max_attempts >= 1, "RETRY_MAX_ATTEMPTS", "must be at least 1")?;
        ensure(
            self.retry_base_delay_ms <= self.retry_max_delay_ms,
            "RETRY_BASE_DELAY_MS",
            "must not exceed RETRY_MAX_DELAY_MS",
        )?;
        self.ladder()?;
        Ok(())
    }

    /// Fails when live trading has no key/secret for the selected network.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.dry_run {
            return Ok(());
        }
        let (key, secret) = self.api_credentials();
        if key.is_empty() || secret.is_empty() {
            let (network, key_var, secret_var) = if self.use_testnet {
                ("testnet", "BINANCE_TESTNET_API_KEY", "BINANCE_TESTNET_API_SECRET")
            } else {
                ("live", "BINANCE_API_KEY", "BINANCE_API_SECRET")
            };
            return Err(ConfigError::MissingCredentials {
                network,
                key_var,
                secret_var,
            });
        }
        Ok(())
    }

    pub fn api_credentials(&self) -> (&str, &str) {
        if self.use_testnet {
            (&self.binance_testnet_api_key, &self.binance_testnet_api_secret)
        } else {
            (&self.binance_api_key, &self.binance_api_secret)
        }
    }

    /// REST base for orders and live candles.
    pub fn exchange_url(&self) -> &str {
        if self.use_testnet {
            &self.binance_testnet_url
        } else {
            &self.binance_base_url
        }
    }

    /// Trend ladder timeframes, coarsest first.
    pub fn ladder(&self) -> Result<Vec<Timeframe>, ConfigError> {
        if self.trend_ladder.is_empty() {
            return Err(ConfigError::OutOfRange {
                key: "TREND_LADDER",
                reason: "must name at least one interval".into(),
            });
        }
        self.trend_ladder
            .iter()
            .map(|code| {
                Timeframe::from_code(code).ok_or_else(|| ConfigError::InvalidValue {
                    key: "TREND_LADDER".into(),
                    value: code.clone(),
                })
            })
            .collect()
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or(self.max_monitor_pool_size)
    }

    pub fn leverage(&self) -> u32 {
        self.risk.leverage.round() as u32
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.global_scan_interval_seconds)
    }

    /// Explicit symbols, or the built-in list.
    pub fn symbols_or_default(&self) -> Vec<String> {
        if self.symbols.is_empty() {
            default_symbols()
        } else {
            self.symbols.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::CapRejectionPolicy;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.validate().unwrap();
        assert!(s.use_testnet && s.dry_run && s.clear_orphan_positions);
        assert_eq!(s.risk.max_positions, 3);
        assert_eq!(s.risk.leverage, 10.0);
        assert_eq!(s.max_monitor_pool_size, 8);
        assert_eq!(s.worker_threads(), 8);
        assert_eq!(s.zones.dwell_bars, 18);
        assert_eq!(s.zones.retest_window_bars, 8);
        assert_eq!(s.taker_fee_bps, 10.0);
        assert_eq!(s.slippage_bps, 2.0);
        assert_eq!(
            s.ladder().unwrap(),
            vec![Timeframe::MN1, Timeframe::W1, Timeframe::D1, Timeframe::H1]
        );
    }

    #[test]
    fn env_overrides() {
        let mut s = Settings::default();
        s.apply_env(env(&[
            ("USE_TESTNET", "false"),
            ("MAX_POSITIONS", "5"),
            ("DWELL_BARS", "24"),
            ("ATR_TIGHT_MULT", "0.6"),
            ("SYMBOLS", "BTCUSDT, ETHUSDT"),
            ("UNIVERSE_N", "12"),
            ("CAP_REJECTION_POLICY", "requeue"),
            ("TAKE_PROFIT_TARGETS", "true"),
            ("DATA_DIR", "/tmp/zb"),
        ]))
        .unwrap();
        assert!(!s.use_testnet);
        assert_eq!(s.risk.max_positions, 5);
        assert_eq!(s.zones.dwell_bars, 24);
        assert_eq!(s.zones.atr_tight_mult, 0.6);
        assert_eq!(s.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(s.universe_n, Some(12));
        assert_eq!(s.risk.cap_rejection_policy, CapRejectionPolicy::Requeue);
        assert!(s.risk.take_profit_targets);
        assert_eq!(s.data_dir, PathBuf::from("/tmp/zb"));
        assert_eq!(s.exchange_url(), LIVE_URL);
    }

    #[test]
    fn bad_values_are_reported() {
        let mut s = Settings::default();
        let err = s.apply_env(env(&[("MAX_POSITIONS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = s.apply_env(env(&[("DRY_RUN", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("DRY_RUN"));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut s = Settings::default();
        s.risk.leverage = 200.0;
        assert!(matches!(s.validate(), Err(ConfigError::OutOfRange { key: "LEVERAGE", .. })));
        let mut s = Settings::default();
        s.trend_ladder = vec!["3d".into()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn credentials_required_only_when_live() {
        let mut s = Settings::default();
        s.require_credentials().unwrap();
        s.dry_run = false;
        assert!(matches!(
            s.require_credentials(),
            Err(ConfigError::MissingCredentials { network: "testnet", .. })
        ));
        s.binance_testnet_api_key = "k".into();
        s.binance_testnet_api_secret = "s".into();
        s.require_credentials().unwrap();
    }

    #[test]
    fn toml_layer_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonebreak.toml");
        std::fs::write(
            &path,
            "max_monitor_pool_size = 4\nsymbols = [\"SOLUSDT\"]\n\n[zones]\ndwell_bars = 30\n\n[risk]\nmax_positions = 2\n",
        )
        .unwrap();
        let s = Settings::from_toml_file(&path).unwrap();
        assert_eq!(s.max_monitor_pool_size, 4);
        assert_eq!(s.zones.dwell_bars, 30);
        assert_eq!(s.zones.retest_window_bars, 8);
        assert_eq!(s.risk.max_positions, 2);
        assert_eq!(s.risk.leverage, 10.0);
        assert_eq!(s.symbols_or_default(), vec!["SOLUSDT"]);
    }
}
