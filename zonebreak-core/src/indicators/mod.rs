//! Indicator library.
//!
//! Pure functions over candle or value slices: EMA (trend ladder), Wilder ATR
//! (zone tightness and buffers) and confirmed swing pivots (trailing stops).
//! `AtrState` is the incremental form of `atr` used by the per-symbol tracker.

pub mod atr;
pub mod ema;
pub mod swing;

pub use atr::{atr, true_range, wilder_smooth, AtrState};
pub use ema::ema;
pub use swing::{latest_swing_high, latest_swing_low, swing_highs, swing_lows, SwingPoint};

/// Build 5-minute candles from close prices for tests.
///
/// open = prev_close (or close for the first candle),
/// high = max(open,close) + 1.0, low = min(open,close) - 1.0.
#[cfg(test)]
pub fn make_candles(closes: &[f64]) -> Vec<crate::domain::Candle> {
    use crate::domain::{Candle, Timeframe};
    use chrono::{TimeZone, Utc};
    let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                symbol: "TEST".to_string(),
                timeframe: Timeframe::M5,
                open_time: base + chrono::Duration::minutes(5 * i as i64),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Default epsilon for indicator tests.
#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
