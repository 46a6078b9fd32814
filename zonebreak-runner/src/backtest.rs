//! Deterministic backtest simulator.
//!
//! Merges every symbol's 5-minute candles into one stream ordered by
//! `(open_time, symbol)` and replays it through the same tracker, trend
//! ladder, risk manager and admission policy the live monitor uses. Runs on
//! one thread; identical inputs give an identical ledger.
//!
//! Per candle:
//! 1. Stop and target check on an open position (levels in force before the
//!    candle), then trail
//! 2. Tracker update
//! 3. Retry of a parked trigger (requeue policy)
//! 4. New triggers → sized and opened at the candle close, with take-profit
//!    targets from the history so far when enabled
//!
//! Fills pay taker fees on both legs and an adverse slippage adjustment.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use zonebreak_core::config::{ConfigError, Settings};
use zonebreak_core::domain::{
    validate_series, BacktestTrade, Candle, CandleError, ExitReason, Side, Timeframe,
};
use zonebreak_core::risk::{CapRejectionPolicy, PendingEntries, Rejection, RiskManager, RiskParams};
use zonebreak_core::trend::{trend_aligned, TrendLadder};
use zonebreak_core::zones::{EntrySignal, SymbolTracker, ZoneEvent, ZoneParams};

use crate::data_loader::{compute_dataset_hash, LoadedData};
use crate::export::ledger_hash;
use crate::metrics::PerformanceMetrics;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("corrupt historical data: {0}")]
    CorruptData(#[from] CandleError),

    #[error("no candles to replay")]
    NoData,

    #[error("invalid backtest config: {0}")]
    InvalidConfig(String),

    #[error("failed to hash ledger: {0}")]
    Ledger(String),
}

impl From<ConfigError> for BacktestError {
    fn from(e: ConfigError) -> Self {
        BacktestError::InvalidConfig(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub zones: ZoneParams,
    pub risk: RiskParams,
    /// Trend ladder, coarsest first.
    pub ladder: Vec<Timeframe>,
    pub trend_slope_lookback: usize,
    pub taker_fee_bps: f64,
    pub slippage_bps: f64,
    pub initial_balance: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            zones: ZoneParams::default(),
            risk: RiskParams::default(),
            ladder: vec![Timeframe::MN1, Timeframe::W1, Timeframe::D1, Timeframe::H1],
            trend_slope_lookback: 1,
            taker_fee_bps: 10.0,
            slippage_bps: 2.0,
            initial_balance: 10_000.0,
        }
    }
}

impl BacktestConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            zones: settings.zones.clone(),
            risk: settings.risk.clone(),
            ladder: settings.ladder()?,
            trend_slope_lookback: settings.trend_slope_lookback,
            taker_fee_bps: settings.taker_fee_bps,
            slippage_bps: settings.slippage_bps,
            initial_balance: settings.initial_balance,
        })
    }

    fn fee_rate(&self) -> f64 {
        self.taker_fee_bps / 10_000.0
    }

    fn slip_rate(&self) -> f64 {
        self.slippage_bps / 10_000.0
    }

    /// Price actually paid when trading in `direction` at `price`.
    fn adverse(&self, price: f64, direction: Side) -> f64 {
        price * (1.0 + direction.sign() * self.slip_rate())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: f64,
}

/// What happened to triggers during the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub triggers: usize,
    pub entries: usize,
    pub cap_rejections: usize,
    pub occupied_rejections: usize,
    pub invalid_rejections: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub candle_count: usize,
    pub initial_balance: f64,
    pub trades: Vec<BacktestTrade>,
    /// Realized equity after each closed trade, starting at the initial balance.
    pub equity_curve: Vec<EquityPoint>,
    /// Marked-to-market equity at each UTC day boundary and at the end.
    pub daily_equity: Vec<EquityPoint>,
    pub metrics: PerformanceMetrics,
    pub stats: SignalStats,
    pub ledger_hash: String,
    pub dataset_hash: String,
    pub has_synthetic: bool,
}

/// Replay loaded data and carry its provenance into the report.
pub fn run_loaded(loaded: &LoadedData, config: &BacktestConfig) -> Result<BacktestReport, BacktestError> {
    let mut report = run_backtest(&loaded.candles, config)?;
    report.has_synthetic = loaded.has_synthetic;
    Ok(report)
}

pub fn run_backtest(
    data: &BTreeMap<String, Vec<Candle>>,
    config: &BacktestConfig,
) -> Result<BacktestReport, BacktestError> {
    if !(config.initial_balance > 0.0) {
        return Err(BacktestError::InvalidConfig("initial balance must be positive".into()));
    }
    for (symbol, series) in data {
        validate_series(symbol, Timeframe::M5, series)?;
    }

    let mut stream: Vec<(DateTime<Utc>, &str, usize)> = data
        .iter()
        .flat_map(|(symbol, series)| {
            series
                .iter()
                .enumerate()
                .map(move |(i, c)| (c.open_time, symbol.as_str(), i))
        })
        .collect();
    if stream.is_empty() {
        return Err(BacktestError::NoData);
    }
    stream.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    let mut sim = Simulation::new(data, config);
    info!(
        symbols = data.len(),
        candles = stream.len(),
        policy = %config.risk.cap_rejection_policy,
        "backtest started"
    );
    for &(_, symbol, i) in &stream {
        sim.step(symbol, i);
    }
    sim.finish(stream.len())
}

struct Simulation<'a> {
    data: &'a BTreeMap<String, Vec<Candle>>,
    config: &'a BacktestConfig,
    trackers: BTreeMap<&'a str, SymbolTracker>,
    ladders: BTreeMap<&'a str, TrendLadder>,
    risk: RiskManager,
    pending: PendingEntries,
    last_close: BTreeMap<&'a str, f64>,
    balance: f64,
    trades: Vec<BacktestTrade>,
    equity_curve: Vec<EquityPoint>,
    daily_equity: Vec<EquityPoint>,
    day: Option<NaiveDate>,
    stats: SignalStats,
}

impl<'a> Simulation<'a> {
    fn new(data: &'a BTreeMap<String, Vec<Candle>>, config: &'a BacktestConfig) -> Self {
        let trackers = data
            .keys()
            .map(|s| (s.as_str(), SymbolTracker::new(s.clone(), config.zones.clone())))
            .collect();
        let ladders = data
            .iter()
            .map(|(s, series)| {
                (
                    s.as_str(),
                    TrendLadder::build(s, series, &config.ladder, config.trend_slope_lookback),
                )
            })
            .collect();
        Self {
            data,
            config,
            trackers,
            ladders,
            risk: RiskManager::new(config.risk.clone()),
            pending: PendingEntries::new(config.zones.retest_window_bars),
            last_close: BTreeMap::new(),
            balance: config.initial_balance,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            daily_equity: Vec::new(),
            day: None,
            stats: SignalStats::default(),
        }
    }

    fn step(&mut self, symbol: &'a str, i: usize) {
        let data = self.data;
        let Some(series) = data.get(symbol) else {
            return;
        };
        let candle = &series[i];
        self.mark_day(candle.open_time);
        if self.equity_curve.is_empty() {
            self.equity_curve.push(EquityPoint {
                time: candle.open_time,
                equity: self.balance,
            });
        }

        if let Some(exit) = self.risk.on_candle(candle, &series[..=i]) {
            self.settle(symbol, exit.price, exit.at, exit.reason, candle.bar_index());
        }
        self.last_close.insert(symbol, candle.close);

        let events = match self.trackers.get_mut(symbol) {
            Some(tracker) => tracker.on_candle(candle.clone()),
            None => Vec::new(),
        };

        if self.config.risk.cap_rejection_policy == CapRejectionPolicy::Requeue {
            if let Some(signal) = self.pending.on_candle(candle) {
                if self.enter(&signal, &series[..=i]) {
                    self.pending.remove(symbol);
                }
            }
        }

        for event in events {
            if let ZoneEvent::Triggered(signal) = event {
                self.stats.triggers += 1;
                self.enter(&signal, &series[..=i]);
            }
        }
    }

    /// Size and open `signal` at its close. Returns true if a position opened.
    fn enter(&mut self, signal: &EntrySignal, history: &[Candle]) -> bool {
        let bias = self
            .ladders
            .get(signal.symbol.as_str())
            .map(|l| l.bias_at(signal.signal_time))
            .unwrap_or(zonebreak_core::trend::Direction::Neutral);
        let aligned = trend_aligned(signal.side, bias);
        let fill = self.config.adverse(signal.entry_price, signal.side);

        let planned = self.risk.plan(signal, fill, self.balance, aligned).map(|mut p| {
            p.entry_fee = fill * p.size * self.config.fee_rate();
            p.entry_slippage = (fill - signal.entry_price).abs() * p.size;
            p
        });
        match planned.and_then(|p| self.risk.open(p)) {
            Ok(_) => {
                self.stats.entries += 1;
                self.risk.attach_targets(&signal.symbol, history);
                true
            }
            Err(Rejection::CapReached { max }) => {
                self.stats.cap_rejections += 1;
                if self.config.risk.cap_rejection_policy == CapRejectionPolicy::Requeue
                    && !self.pending.contains(&signal.symbol)
                {
                    self.stats.requeued += 1;
                    self.pending.park(signal.clone());
                } else {
                    debug!(symbol = %signal.symbol, max, "trigger retired at position cap");
                }
                false
            }
            Err(Rejection::SymbolOccupied { .. }) => {
                self.stats.occupied_rejections += 1;
                debug!(symbol = %signal.symbol, "trigger skipped, symbol already positioned");
                false
            }
            Err(e) => {
                self.stats.invalid_rejections += 1;
                debug!(symbol = %signal.symbol, reason = %e, "trigger rejected");
                false
            }
        }
    }

    /// Close `symbol` at raw price `price`, charging exit costs.
    fn settle(&mut self, symbol: &str, price: f64, at: DateTime<Utc>, reason: ExitReason, bar: i64) {
        let held = match self.risk.book().get(symbol) {
            Some(p) => p.side,
            None => return,
        };
        let fill = self.config.adverse(price, held.opposite());
        let Some(closed) = self.risk.close(symbol, fill, at, reason) else {
            return;
        };
        let p = &closed.position;
        let exit_fee = fill * p.size * self.config.fee_rate();
        let exit_slippage = (fill - price).abs() * p.size;
        let net_pnl = closed.gross_pnl() - p.entry_fee - exit_fee;
        let risk = p.risk_per_unit() * p.size;
        let r_multiple = if risk > 0.0 { net_pnl / risk } else { 0.0 };

        self.balance += net_pnl;
        self.trades.push(BacktestTrade {
            symbol: p.symbol.clone(),
            side: p.side,
            entry_time: p.opened_at,
            entry_price: p.entry_price,
            exit_time: at,
            exit_price: fill,
            size: p.size,
            fees: p.entry_fee + exit_fee,
            slippage: p.entry_slippage + exit_slippage,
            net_pnl,
            mfe_r: p.mfe_r(),
            mae_r: p.mae_r(),
            r_multiple,
            exit_reason: reason,
            trend_aligned: p.trend_aligned,
            bars_held: bar - p.entry_bar,
        });
        self.equity_curve.push(EquityPoint {
            time: at,
            equity: self.balance,
        });
    }

    fn mark_to_market(&self) -> f64 {
        self.risk
            .book()
            .snapshot()
            .iter()
            .map(|p| {
                let last = self.last_close.get(p.symbol.as_str()).copied().unwrap_or(p.entry_price);
                p.gross_pnl_at(last) - p.entry_fee
            })
            .sum::<f64>()
            + self.balance
    }

    fn mark_day(&mut self, t: DateTime<Utc>) {
        let today = t.date_naive();
        match self.day {
            Some(day) if day == today => {}
            Some(_) => {
                let equity = self.mark_to_market();
                self.daily_equity.push(EquityPoint {
                    time: Timeframe::D1.bucket_start(t),
                    equity,
                });
                self.day = Some(today);
            }
            None => {
                self.daily_equity.push(EquityPoint {
                    time: Timeframe::D1.bucket_start(t),
                    equity: self.balance,
                });
                self.day = Some(today);
            }
        }
    }

    fn finish(mut self, candle_count: usize) -> Result<BacktestReport, BacktestError> {
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for series in self.data.values() {
            if let (Some(first), Some(last)) = (series.first(), series.last()) {
                start = Some(start.map_or(first.open_time, |s| s.min(first.open_time)));
                end = Some(end.map_or(last.close_time(), |e| e.max(last.close_time())));
            }
        }
        let (Some(start), Some(end)) = (start, end) else {
            return Err(BacktestError::NoData);
        };

        let data = self.data;
        for symbol in self.risk.book().symbols() {
            let Some(last) = data.get(&symbol).and_then(|s| s.last()) else {
                continue;
            };
            self.settle(&symbol, last.close, last.close_time(), ExitReason::EndOfData, last.bar_index());
        }
        self.daily_equity.push(EquityPoint {
            time: end,
            equity: self.balance,
        });

        let equity: Vec<f64> = self.equity_curve.iter().map(|p| p.equity).collect();
        let daily: Vec<f64> = self.daily_equity.iter().map(|p| p.equity).collect();
        let span_days = (end - start).num_seconds() as f64 / 86_400.0;
        let metrics = PerformanceMetrics::compute(&self.trades, &equity, &daily, span_days);
        let ledger_hash = ledger_hash(&self.trades).map_err(|e| BacktestError::Ledger(e.to_string()))?;

        info!(
            trades = metrics.trade_count,
            win_rate = metrics.win_rate,
            final_equity = metrics.final_equity,
            triggers = self.stats.triggers,
            cap_rejections = self.stats.cap_rejections,
            "backtest finished"
        );

        Ok(BacktestReport {
            symbols: self.data.keys().cloned().collect(),
            start,
            end,
            candle_count,
            initial_balance: self.config.initial_balance,
            trades: self.trades,
            equity_curve: self.equity_curve,
            daily_equity: self.daily_equity,
            metrics,
            stats: self.stats,
            ledger_hash,
            dataset_hash: compute_dataset_hash(self.data),
            has_synthetic: false,
        })
    }
}
