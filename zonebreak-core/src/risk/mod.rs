//! Risk and position management.
//!
//! [`RiskManager`] turns an [`EntrySignal`] into a sized [`Position`], owns the
//! [`PositionBook`], checks stop and take-profit exits and ratchets the
//! trailing stop. The live monitor and the backtest simulator drive it
//! identically.

pub mod admission;
pub mod book;
pub mod ratchet;
pub mod sizing;
pub mod targets;

pub use admission::{CapRejectionPolicy, ParkedEntry, PendingEntries};
pub use book::PositionBook;
pub use ratchet::RatchetState;
pub use sizing::{position_size, round_to_step};
pub use targets::{nearest_targets, Targets};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Candle, ExitReason, Position, Side};
use crate::indicators::{latest_swing_high, latest_swing_low};
use crate::zones::EntrySignal;

/// Why an entry was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("position cap reached ({max} open)")]
    CapReached { max: usize },
    #[error("{symbol} already has an open position")]
    SymbolOccupied { symbol: String },
    #[error("invalid stop distance (entry {entry}, stop {stop})")]
    InvalidRisk { entry: f64, stop: f64 },
    #[error("computed size is zero")]
    ZeroSize,
    #[error("balance {0} is not positive")]
    NoBalance(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    pub max_positions: usize,
    pub leverage: f64,
    pub pct_trend_aligned: f64,
    pub pct_counter_trend: f64,
    pub swing_left: usize,
    pub swing_right: usize,
    pub cap_rejection_policy: CapRejectionPolicy,
    /// Exit at higher-timeframe swing targets as well as on the stop.
    pub take_profit_targets: bool,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_positions: 3,
            leverage: 10.0,
            pct_trend_aligned: 5.0,
            pct_counter_trend: 3.0,
            swing_left: 2,
            swing_right: 2,
            cap_rejection_policy: CapRejectionPolicy::Retire,
            take_profit_targets: false,
        }
    }
}

/// A stop or target was crossed; the caller flattens and then calls
/// [`RiskManager::close`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub reason: ExitReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub reason: ExitReason,
}

impl ClosedPosition {
    pub fn gross_pnl(&self) -> f64 {
        self.position.gross_pnl_at(self.exit_price)
    }
}

#[derive(Debug)]
pub struct RiskManager {
    params: RiskParams,
    book: PositionBook,
}

impl RiskManager {
    pub fn new(params: RiskParams) -> Self {
        let book = PositionBook::new(params.max_positions);
        Self { params, book }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn size_pct(&self, trend_aligned: bool) -> f64 {
        if trend_aligned {
            self.params.pct_trend_aligned
        } else {
            self.params.pct_counter_trend
        }
    }

    /// Size a position for `signal` filled at `fill_price`. Nothing is reserved.
    pub fn plan(
        &self,
        signal: &EntrySignal,
        fill_price: f64,
        balance: f64,
        trend_aligned: bool,
    ) -> Result<Position, Rejection> {
        let pct = self.size_pct(trend_aligned);
        let size = position_size(balance, pct, fill_price, signal.stop_price, self.params.leverage)?;
        // a fill through the stop leaves nothing to protect
        if signal.side.sign() * (fill_price - signal.stop_price) <= 0.0 {
            return Err(Rejection::InvalidRisk {
                entry: fill_price,
                stop: signal.stop_price,
            });
        }
        Ok(Position {
            symbol: signal.symbol.clone(),
            side: signal.side,
            entry_price: fill_price,
            size,
            stop_price: signal.stop_price,
            trailing_stop_price: signal.stop_price,
            opened_at: signal.signal_time,
            trend_aligned,
            entry_bar: signal.bar_index,
            zone_id: signal.zone_id,
            best_price: fill_price,
            worst_price: fill_price,
            entry_fee: 0.0,
            entry_slippage: 0.0,
            target_1: None,
            target_2: None,
        })
    }

    /// Atomically insert a planned position.
    pub fn open(&self, position: Position) -> Result<Position, Rejection> {
        self.book.try_open(position.clone())?;
        info!(
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            size = position.size,
            stop = position.stop_price,
            trend_aligned = position.trend_aligned,
            "position opened"
        );
        Ok(position)
    }

    /// Undo an [`open`](Self::open) whose exchange order never filled.
    pub fn abandon(&self, symbol: &str) -> Option<Position> {
        let removed = self.book.close(symbol);
        if removed.is_some() {
            info!(symbol, "reservation released after failed order");
        }
        removed
    }

    /// Set T1/T2 on the open position for `symbol` from its candle window.
    ///
    /// A no-op unless `take_profit_targets` is on. Returns the targets stored.
    pub fn attach_targets(&self, symbol: &str, recent: &[Candle]) -> Option<Targets> {
        if !self.params.take_profit_targets {
            return None;
        }
        let (left, right) = (self.params.swing_left, self.params.swing_right);
        self.book.with_position(symbol, |p| {
            let targets = nearest_targets(recent, p.side, p.entry_price, left, right);
            p.target_1 = targets.t1;
            p.target_2 = targets.t2;
            if !targets.is_empty() {
                debug!(symbol, t1 = ?targets.t1, t2 = ?targets.t2, "take-profit targets set");
            }
            targets
        })
    }

    /// Stop check with the stop in force before `candle`, then targets.
    pub fn check_exit(&self, candle: &Candle) -> Option<ExitSignal> {
        self.book
            .with_position(&candle.symbol, |p| {
                if let Some(price) = p.stop_fill(candle) {
                    match p.side {
                        Side::Long => p.worst_price = p.worst_price.min(price),
                        Side::Short => p.worst_price = p.worst_price.max(price),
                    }
                    return Some(ExitSignal {
                        symbol: p.symbol.clone(),
                        side: p.side,
                        price,
                        reason: p.stop_reason(),
                        at: candle.close_time(),
                    });
                }
                let (price, reason) = p.target_fill(candle)?;
                match p.side {
                    Side::Long => p.best_price = p.best_price.max(price),
                    Side::Short => p.best_price = p.best_price.min(price),
                }
                Some(ExitSignal {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    price,
                    reason,
                    at: candle.close_time(),
                })
            })
            .flatten()
    }

    /// Record excursions and ratchet the stop toward the latest confirmed swing.
    ///
    /// `recent` is the symbol's candle window ending at `candle`. Only pivots
    /// formed since entry are proposed. Returns the new stop if it moved.
    pub fn update_trail(&self, candle: &Candle, recent: &[Candle]) -> Option<f64> {
        let (left, right) = (self.params.swing_left, self.params.swing_right);
        self.book
            .with_position(&candle.symbol, |p| {
                p.record_excursion(candle);
                let from = p.entry_bar - left as i64;
                let start = recent.partition_point(|c| c.bar_index() < from);
                let since_entry = &recent[start..];
                let proposal = match p.side {
                    Side::Long => latest_swing_low(since_entry, left, right),
                    Side::Short => latest_swing_high(since_entry, left, right),
                }?;
                let mut ratchet = RatchetState::with_initial_level(p.side, p.trailing_stop_price);
                if !ratchet.would_tighten(proposal) {
                    return None;
                }
                let next = ratchet.apply(proposal)?;
                debug!(symbol = %p.symbol, from = p.trailing_stop_price, to = next, "trailing stop moved");
                p.trailing_stop_price = next;
                Some(next)
            })
            .flatten()
    }

    /// Exit check, then trail update if the position survived.
    pub fn on_candle(&self, candle: &Candle, recent: &[Candle]) -> Option<ExitSignal> {
        if let Some(exit) = self.check_exit(candle) {
            return Some(exit);
        }
        self.update_trail(candle, recent);
        None
    }

    /// Remove the position for `symbol` once flattened at `price`.
    pub fn close(
        &self,
        symbol: &str,
        price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Option<ClosedPosition> {
        let position = self.book.close(symbol)?;
        let closed = ClosedPosition {
            position,
            exit_price: price,
            exit_time: at,
            reason,
        };
        info!(
            symbol,
            exit = price,
            %reason,
            pnl = closed.gross_pnl(),
            "position closed"
        );
        Some(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Timeframe, ZoneId};
    use chrono::TimeZone;

    fn candle(bar: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "ETHUSDT".into(),
            timeframe: Timeframe::M5,
            open_time: Utc.timestamp_opt(bar * 300, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn signal(side: Side, entry: f64, stop: f64) -> EntrySignal {
        EntrySignal {
            symbol: "ETHUSDT".into(),
            zone_id: ZoneId(3),
            side,
            entry_price: entry,
            stop_price: stop,
            bar_index: 100,
            signal_time: Utc.timestamp_opt(101 * 300, 0).unwrap(),
            zone_top: 100.0,
            zone_bottom: 99.0,
            breakout_level: 100.3,
            dwell_bars: 18,
            touches: 3,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskParams::default())
    }

    #[test]
    fn plan_sizes_by_alignment() {
        let rm = manager();
        let s = signal(Side::Long, 101.0, 100.0);
        let aligned = rm.plan(&s, 101.0, 10_000.0, true).unwrap();
        let counter = rm.plan(&s, 101.0, 10_000.0, false).unwrap();
        assert!((aligned.size - 500.0).abs() < 1e-9);
        assert!((counter.size - 300.0).abs() < 1e-9);
        assert_eq!(aligned.trailing_stop_price, 100.0);
    }

    #[test]
    fn fill_through_stop_is_invalid() {
        let rm = manager();
        let s = signal(Side::Long, 101.0, 100.0);
        assert!(matches!(
            rm.plan(&s, 99.5, 10_000.0, true),
            Err(Rejection::InvalidRisk { .. })
        ));
    }

    #[test]
    fn exit_uses_stop_before_candle() {
        let rm = manager();
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p).unwrap();
        // low of 100.2 does not reach 100.0
        assert!(rm.on_candle(&candle(101, 101.0, 102.0, 100.2, 101.5), &[]).is_none());
        let exit = rm
            .on_candle(&candle(102, 101.0, 101.2, 99.5, 99.8), &[])
            .expect("stopped");
        assert_eq!(exit.price, 100.0);
        assert_eq!(exit.reason, ExitReason::StopLoss);
        // exit does not remove: the caller closes after flattening
        assert!(rm.book().contains("ETHUSDT"));
        let closed = rm.close("ETHUSDT", exit.price, exit.at, exit.reason).unwrap();
        assert!((closed.gross_pnl() + 500.0).abs() < 1e-9);
    }

    #[test]
    fn trail_follows_confirmed_swing_low() {
        let rm = manager();
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p).unwrap();
        let bars = vec![
            candle(98, 100.0, 100.5, 99.5, 100.2),
            candle(99, 100.2, 100.8, 99.8, 100.6),
            candle(100, 100.6, 101.2, 100.0, 101.0),
            candle(101, 101.0, 102.0, 101.2, 101.8),
            candle(102, 101.8, 102.5, 101.5, 101.6),
            candle(103, 101.6, 102.0, 101.0, 101.9),
            candle(104, 101.9, 103.0, 101.8, 102.8),
            candle(105, 102.8, 104.0, 102.4, 103.8),
        ];
        let mut stops = Vec::new();
        for i in 3..bars.len() {
            assert!(rm.on_candle(&bars[i], &bars[..=i]).is_none());
            stops.push(rm.book().get("ETHUSDT").unwrap().trailing_stop_price);
        }
        // swing low at bar 103 (101.0) confirms on bar 105
        assert_eq!(stops, vec![100.0, 100.0, 100.0, 100.0, 101.0]);
        let exit = rm.check_exit(&candle(106, 103.0, 103.1, 100.5, 100.7)).unwrap();
        assert_eq!(exit.reason, ExitReason::TrailingStop);
        assert_eq!(exit.price, 101.0);
    }

    #[test]
    fn short_trail_moves_down() {
        let rm = manager();
        let p = rm.plan(&signal(Side::Short, 98.0, 99.0), 98.0, 10_000.0, false).unwrap();
        rm.open(p).unwrap();
        let bars = vec![
            candle(99, 98.0, 98.5, 97.5, 98.0),
            candle(100, 98.0, 98.6, 97.6, 98.0),
            candle(101, 98.0, 98.9, 97.8, 98.2),
            candle(102, 98.2, 98.4, 97.0, 97.2),
            candle(103, 97.2, 97.5, 96.0, 96.2),
        ];
        for i in 2..bars.len() {
            assert!(rm.on_candle(&bars[i], &bars[..=i]).is_none());
        }
        let stop = rm.book().get("ETHUSDT").unwrap().trailing_stop_price;
        assert!((stop - 98.9).abs() < 1e-12);
        let exit = rm.on_candle(&candle(104, 96.2, 99.5, 96.0, 96.5), &bars).unwrap();
        assert_eq!(exit.price, 98.9);
        assert_eq!(exit.reason, ExitReason::TrailingStop);
        let pos = rm.book().get("ETHUSDT").unwrap();
        assert!((pos.mfe_r() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn abandon_releases_slot() {
        let rm = RiskManager::new(RiskParams {
            max_positions: 1,
            ..RiskParams::default()
        });
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p.clone()).unwrap();
        assert!(rm.abandon("ETHUSDT").is_some());
        rm.open(p).unwrap();
    }

    #[test]
    fn targets_exit_after_the_stop_check() {
        let rm = RiskManager::new(RiskParams {
            take_profit_targets: true,
            ..RiskParams::default()
        });
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p).unwrap();
        rm.book().with_position("ETHUSDT", |p| {
            p.target_1 = Some(103.0);
            p.target_2 = Some(104.5);
        });

        // wide bar through both the stop and T1: the stop wins
        let exit = rm.check_exit(&candle(101, 101.0, 103.5, 99.5, 102.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);

        let exit = rm.check_exit(&candle(102, 102.0, 103.2, 101.5, 103.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::Target1);
        assert_eq!(exit.price, 103.0);
        assert_eq!(rm.book().get("ETHUSDT").unwrap().best_price, 103.0);
    }

    #[test]
    fn targets_attach_only_when_enabled() {
        let rm = manager();
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p).unwrap();
        assert_eq!(rm.attach_targets("ETHUSDT", &[]), None);

        let rm = RiskManager::new(RiskParams {
            take_profit_targets: true,
            ..RiskParams::default()
        });
        let p = rm.plan(&signal(Side::Long, 101.0, 100.0), 101.0, 10_000.0, true).unwrap();
        rm.open(p).unwrap();
        assert_eq!(rm.attach_targets("ETHUSDT", &[]), Some(Targets::default()));
        assert_eq!(rm.attach_targets("BTCUSDT", &[]), None);
    }
}
