//! Open position state.

use super::candle::Candle;
use super::ids::ZoneId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Binance order side for opening in this direction.
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Initial stop hit before any trail tightened it.
    StopLoss,
    /// Ratcheted swing stop hit.
    TrailingStop,
    /// Explicit close request (operator or exchange state).
    External,
    /// Backtest data ran out with the position still open.
    EndOfData,
    /// Nearest higher-timeframe swing beyond entry reached.
    Target1,
    /// Second swing target reached.
    Target2,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::External => "external",
            ExitReason::EndOfData => "end_of_data",
            ExitReason::Target1 => "target_1",
            ExitReason::Target2 => "target_2",
        };
        f.write_str(s)
    }
}

/// An open position. Only the position book creates, mutates and removes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    /// Initial protective stop (trigger candle extreme).
    pub stop_price: f64,
    /// Stop currently in force. Never loosens.
    pub trailing_stop_price: f64,
    pub opened_at: DateTime<Utc>,
    pub trend_aligned: bool,
    pub entry_bar: i64,
    pub zone_id: ZoneId,
    /// Most favorable price seen since entry.
    pub best_price: f64,
    /// Most adverse price seen since entry.
    pub worst_price: f64,
    pub entry_fee: f64,
    pub entry_slippage: f64,
    /// Take-profit levels, nearest first.
    #[serde(default)]
    pub target_1: Option<f64>,
    #[serde(default)]
    pub target_2: Option<f64>,
}

impl Position {
    /// Price distance between entry and the initial stop.
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_price).abs()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }

    /// Fill price if `candle` crosses the stop currently in force.
    ///
    /// A candle that opens beyond the stop fills at its open.
    pub fn stop_fill(&self, candle: &Candle) -> Option<f64> {
        let stop = self.trailing_stop_price;
        match self.side {
            Side::Long if candle.low <= stop => Some(candle.open.min(stop)),
            Side::Short if candle.high >= stop => Some(candle.open.max(stop)),
            _ => None,
        }
    }

    /// Fill price and reason if `candle` reaches a take-profit target.
    ///
    /// The farther target is checked first. A candle that opens beyond the
    /// target fills at its open.
    pub fn target_fill(&self, candle: &Candle) -> Option<(f64, ExitReason)> {
        [(self.target_2, ExitReason::Target2), (self.target_1, ExitReason::Target1)]
            .into_iter()
            .find_map(|(target, reason)| {
                let target = target?;
                match self.side {
                    Side::Long if candle.high >= target => Some((candle.open.max(target), reason)),
                    Side::Short if candle.low <= target => Some((candle.open.min(target), reason)),
                    _ => None,
                }
            })
    }

    /// Exit reason for a stop fill given the current trail.
    pub fn stop_reason(&self) -> ExitReason {
        if self.trailing_stop_price == self.stop_price {
            ExitReason::StopLoss
        } else {
            ExitReason::TrailingStop
        }
    }

    pub fn record_excursion(&mut self, candle: &Candle) {
        match self.side {
            Side::Long => {
                self.best_price = self.best_price.max(candle.high);
                self.worst_price = self.worst_price.min(candle.low);
            }
            Side::Short => {
                self.best_price = self.best_price.min(candle.low);
                self.worst_price = self.worst_price.max(candle.high);
            }
        }
    }

    /// Maximum favorable excursion in R multiples (>= 0).
    pub fn mfe_r(&self) -> f64 {
        let risk = self.risk_per_unit();
        if risk <= 0.0 {
            return 0.0;
        }
        (self.side.sign() * (self.best_price - self.entry_price) / risk).max(0.0)
    }

    /// Maximum adverse excursion in R multiples, as a magnitude (>= 0).
    pub fn mae_r(&self) -> f64 {
        let risk = self.risk_per_unit();
        if risk <= 0.0 {
            return 0.0;
        }
        (self.side.sign() * (self.entry_price - self.worst_price) / risk).max(0.0)
    }

    /// Gross PnL if closed at `price`.
    pub fn gross_pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::Timeframe;
    use chrono::TimeZone;

    fn long_position() -> Position {
        Position {
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            size: 10.0,
            stop_price: 98.0,
            trailing_stop_price: 98.0,
            opened_at: Utc.timestamp_opt(0, 0).unwrap(),
            trend_aligned: false,
            entry_bar: 0,
            zone_id: ZoneId(1),
            best_price: 100.0,
            worst_price: 100.0,
            entry_fee: 0.0,
            entry_slippage: 0.0,
            target_1: None,
            target_2: None,
        }
    }

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "ETHUSDT".into(),
            timeframe: Timeframe::M5,
            open_time: Utc.timestamp_opt(300, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn long_stop_fills_at_stop() {
        let p = long_position();
        assert_eq!(p.stop_fill(&candle(99.0, 99.5, 97.5, 98.5)), Some(98.0));
    }

    #[test]
    fn long_stop_gap_fills_at_open() {
        let p = long_position();
        assert_eq!(p.stop_fill(&candle(96.0, 97.0, 95.0, 96.5)), Some(96.0));
    }

    #[test]
    fn long_stop_untouched() {
        let p = long_position();
        assert_eq!(p.stop_fill(&candle(100.0, 101.0, 98.5, 100.5)), None);
    }

    #[test]
    fn short_stop_fills_at_stop() {
        let mut p = long_position();
        p.side = Side::Short;
        p.stop_price = 102.0;
        p.trailing_stop_price = 102.0;
        assert_eq!(p.stop_fill(&candle(101.0, 102.5, 100.0, 101.0)), Some(102.0));
        assert_eq!(p.stop_fill(&candle(103.0, 104.0, 102.5, 103.5)), Some(103.0));
    }

    #[test]
    fn excursions_in_r() {
        let mut p = long_position();
        p.record_excursion(&candle(100.0, 104.0, 99.0, 103.0));
        // risk = 2.0; best = 104 → +2R; worst = 99 → 0.5R adverse
        assert!((p.mfe_r() - 2.0).abs() < 1e-12);
        assert!((p.mae_r() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stop_reason_tracks_trail() {
        let mut p = long_position();
        assert_eq!(p.stop_reason(), ExitReason::StopLoss);
        p.trailing_stop_price = 99.0;
        assert_eq!(p.stop_reason(), ExitReason::TrailingStop);
    }

    #[test]
    fn farther_target_wins_on_a_wide_candle() {
        let mut p = long_position();
        p.target_1 = Some(103.0);
        p.target_2 = Some(105.0);
        assert_eq!(p.target_fill(&candle(100.0, 102.9, 99.5, 102.0)), None);
        assert_eq!(
            p.target_fill(&candle(102.0, 103.5, 101.5, 103.2)),
            Some((103.0, ExitReason::Target1))
        );
        assert_eq!(
            p.target_fill(&candle(103.0, 105.5, 102.5, 104.0)),
            Some((105.0, ExitReason::Target2))
        );
        assert_eq!(
            p.target_fill(&candle(106.0, 107.0, 105.5, 106.5)),
            Some((106.0, ExitReason::Target2))
        );
    }

    #[test]
    fn short_targets_sit_below() {
        let mut p = long_position();
        p.side = Side::Short;
        p.target_1 = Some(97.0);
        assert_eq!(p.target_fill(&candle(99.0, 99.5, 97.5, 98.0)), None);
        assert_eq!(
            p.target_fill(&candle(98.0, 98.5, 96.5, 97.0)),
            Some((97.0, ExitReason::Target1))
        );
        assert_eq!(ExitReason::Target1.to_string(), "target_1");
    }

    #[test]
    fn gross_pnl_is_signed() {
        let mut p = long_position();
        assert!((p.gross_pnl_at(101.0) - 10.0).abs() < 1e-12);
        p.side = Side::Short;
        assert!((p.gross_pnl_at(101.0) + 10.0).abs() < 1e-12);
    }
}
