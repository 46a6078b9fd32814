//! Multi-timeframe trend analysis.
//!
//! A timeframe is Bullish when close > EMA50 > EMA200 and both EMAs are
//! rising over the slope lookback; Bearish is the mirror; anything else is
//! Neutral. The aggregate bias requires every ladder timeframe to agree.
//! Bias only classifies a trade as trend-aligned or counter-trend.

pub mod resample;

pub use resample::resample;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Candle, Side, Timeframe};
use crate::indicators::ema;

pub const EMA_FAST: usize = 50;
pub const EMA_SLOW: usize = 200;
/// Fewer closed candles than this label the timeframe Neutral.
pub const TREND_MIN_BARS: usize = 210;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

/// Trend label for one symbol on one timeframe. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendBias {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub computed_at: DateTime<Utc>,
}

/// Whether a trade on `side` agrees with the aggregate `bias`.
pub fn trend_aligned(side: Side, bias: Direction) -> bool {
    matches!(
        (side, bias),
        (Side::Long, Direction::Bullish) | (Side::Short, Direction::Bearish)
    )
}

/// Unanimous aggregate over a ladder; an empty ladder is Neutral.
pub fn aggregate(biases: &[TrendBias]) -> Direction {
    let Some(first) = biases.first() else {
        return Direction::Neutral;
    };
    let dir = first.direction;
    if dir != Direction::Neutral && biases.iter().all(|b| b.direction == dir) {
        dir
    } else {
        Direction::Neutral
    }
}

/// Label a close series using its final value.
pub fn label_series(closes: &[f64], slope_lookback: usize) -> Direction {
    if closes.len() < TREND_MIN_BARS {
        return Direction::Neutral;
    }
    let fast = ema(closes, EMA_FAST);
    let slow = ema(closes, EMA_SLOW);
    label_at(closes, &fast, &slow, closes.len() - 1, slope_lookback)
}

fn label_at(closes: &[f64], fast: &[f64], slow: &[f64], k: usize, lookback: usize) -> Direction {
    let lookback = lookback.max(1);
    if k + 1 < TREND_MIN_BARS || k < lookback {
        return Direction::Neutral;
    }
    let (c, f, s) = (closes[k], fast[k], slow[k]);
    let (fp, sp) = (fast[k - lookback], slow[k - lookback]);
    if [c, f, s, fp, sp].iter().any(|v| v.is_nan()) {
        return Direction::Neutral;
    }
    if c > f && f > s && f > fp && s > sp {
        Direction::Bullish
    } else if c < f && f < s && f < fp && s < sp {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// Label each timeframe from already-closed candles (live path).
pub fn biases_from_series(
    symbol: &str,
    series: &[(Timeframe, Vec<Candle>)],
    slope_lookback: usize,
    computed_at: DateTime<Utc>,
) -> Vec<TrendBias> {
    series
        .iter()
        .map(|(tf, candles)| {
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            TrendBias {
                symbol: symbol.to_string(),
                timeframe: *tf,
                direction: label_series(&closes, slope_lookback),
                computed_at,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct LadderSeries {
    timeframe: Timeframe,
    close_times: Vec<DateTime<Utc>>,
    closes: Vec<f64>,
    fast: Vec<f64>,
    slow: Vec<f64>,
}

/// Precomputed trend ladder for historical replay.
///
/// Resamples the full 5-minute history once; `bias_at(t)` only reads buckets
/// closed by `t`, and labels match `label_series` on the same prefix.
#[derive(Debug, Clone)]
pub struct TrendLadder {
    symbol: String,
    series: Vec<LadderSeries>,
    slope_lookback: usize,
}

impl TrendLadder {
    pub fn build(
        symbol: &str,
        candles_5m: &[Candle],
        ladder: &[Timeframe],
        slope_lookback: usize,
    ) -> Self {
        let series = ladder
            .iter()
            .map(|&tf| {
                let buckets = resample(candles_5m, tf, None);
                let closes: Vec<f64> = buckets.iter().map(|c| c.close).collect();
                LadderSeries {
                    timeframe: tf,
                    close_times: buckets.iter().map(|c| c.close_time()).collect(),
                    fast: ema(&closes, EMA_FAST),
                    slow: ema(&closes, EMA_SLOW),
                    closes,
                }
            })
            .collect();
        Self {
            symbol: symbol.to_string(),
            series,
            slope_lookback,
        }
    }

    pub fn biases_at(&self, t: DateTime<Utc>) -> Vec<TrendBias> {
        self.series
            .iter()
            .map(|s| {
                let k = s.close_times.partition_point(|ct| *ct <= t);
                let direction = if k == 0 {
                    Direction::Neutral
                } else {
                    label_at(&s.closes, &s.fast, &s.slow, k - 1, self.slope_lookback)
                };
                TrendBias {
                    symbol: self.symbol.clone(),
                    timeframe: s.timeframe,
                    direction,
                    computed_at: t,
                }
            })
            .collect()
    }

    pub fn bias_at(&self, t: DateTime<Utc>) -> Direction {
        aggregate(&self.biases_at(t))
    }
}
