//! Take-profit targets from higher-timeframe swing points.
//!
//! The 5-minute window is resampled to 1h, 4h and 1d. Confirmed swing highs
//! (longs) or swing lows (shorts) from all three are pooled; the nearest one
//! beyond the reference price is T1 and the next one out is T2.

use serde::{Deserialize, Serialize};

use crate::domain::{Candle, Side, Timeframe};
use crate::indicators::{swing_highs, swing_lows};
use crate::trend::resample;

pub const TARGET_TIMEFRAMES: [Timeframe; 3] = [Timeframe::H1, Timeframe::H4, Timeframe::D1];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    pub t1: Option<f64>,
    pub t2: Option<f64>,
}

impl Targets {
    pub fn is_empty(&self) -> bool {
        self.t1.is_none() && self.t2.is_none()
    }
}

/// Nearest two swing levels beyond `reference` in the trade's favor.
pub fn nearest_targets(candles: &[Candle], side: Side, reference: f64, left: usize, right: usize) -> Targets {
    let mut levels: Vec<f64> = TARGET_TIMEFRAMES
        .iter()
        .flat_map(|&tf| {
            let bars = resample(candles, tf, None);
            match side {
                Side::Long => swing_highs(&bars, left, right),
                Side::Short => swing_lows(&bars, left, right),
            }
        })
        .map(|p| p.price)
        .filter(|&price| side.sign() * (price - reference) > 0.0)
        .collect();

    // nearest first
    levels.sort_by(|a, b| match side {
        Side::Long => a.total_cmp(b),
        Side::Short => b.total_cmp(a),
    });
    levels.dedup();

    let mut nearest = levels.into_iter();
    Targets {
        t1: nearest.next(),
        t2: nearest.next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Twelve 5-minute candles per hour; every candle in hour `h` spans
    /// `[highs[h] - 2, highs[h]]`, so the 1h bars carry exactly these highs.
    fn hourly(highs: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        highs
            .iter()
            .enumerate()
            .flat_map(|(h, &high)| {
                (0..12).map(move |k| Candle {
                    symbol: "SOLUSDT".into(),
                    timeframe: Timeframe::M5,
                    open_time: base + Duration::minutes(60 * h as i64 + 5 * k),
                    open: high - 1.0,
                    high,
                    low: high - 2.0,
                    close: high - 1.0,
                    volume: 1.0,
                })
            })
            .collect()
    }

    const HIGHS: [f64; 10] = [100.0, 101.0, 105.0, 102.0, 101.0, 103.0, 108.0, 104.0, 103.0, 100.0];

    #[test]
    fn long_targets_are_the_nearest_swing_highs_above() {
        let targets = nearest_targets(&hourly(&HIGHS), Side::Long, 99.0, 2, 2);
        assert_eq!(targets.t1, Some(105.0));
        assert_eq!(targets.t2, Some(108.0));
    }

    #[test]
    fn levels_at_or_behind_the_reference_are_skipped() {
        let targets = nearest_targets(&hourly(&HIGHS), Side::Long, 105.0, 2, 2);
        assert_eq!(targets.t1, Some(108.0));
        assert_eq!(targets.t2, None);

        let none = nearest_targets(&hourly(&HIGHS), Side::Long, 110.0, 2, 2);
        assert!(none.is_empty());
    }

    #[test]
    fn short_targets_are_swing_lows_below() {
        // 1h lows are highs - 2; the low at hour 4 (99) is the only pivot
        let targets = nearest_targets(&hourly(&HIGHS), Side::Short, 100.5, 2, 2);
        assert_eq!(targets.t1, Some(99.0));
        assert_eq!(targets.t2, None);
    }

    #[test]
    fn monotone_history_has_no_targets() {
        let falling: Vec<f64> = (0..10).map(|h| 120.0 - h as f64).collect();
        assert!(nearest_targets(&hourly(&falling), Side::Long, 100.0, 2, 2).is_empty());
        assert!(nearest_targets(&[], Side::Short, 100.0, 2, 2).is_empty());
    }
}
