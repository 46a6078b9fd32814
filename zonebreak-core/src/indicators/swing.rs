//! Confirmed swing pivots.
//!
//! Bar `i` is a swing low when its low is strictly below the `left` lows before
//! it and no higher than the `right` lows after it (mirrored for highs). Equal
//! lows resolve to the first bar. A pivot is only confirmed once `right` later
//! candles exist, so the newest `right` candles never qualify.

use crate::domain::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
}

fn is_pivot(values: &[f64], i: usize, left: usize, right: usize, low: bool) -> bool {
    let v = values[i];
    let before = values[i - left..i]
        .iter()
        .all(|&w| if low { v < w } else { v > w });
    let after = values[i + 1..=i + right]
        .iter()
        .all(|&w| if low { v <= w } else { v >= w });
    before && after
}

fn pivots(values: &[f64], left: usize, right: usize, low: bool) -> Vec<SwingPoint> {
    let n = values.len();
    if n < left + right + 1 {
        return Vec::new();
    }
    (left..n - right)
        .filter(|&i| is_pivot(values, i, left, right, low))
        .map(|i| SwingPoint {
            index: i,
            price: values[i],
        })
        .collect()
}

fn latest_pivot(values: &[f64], left: usize, right: usize, low: bool) -> Option<f64> {
    let n = values.len();
    if n < left + right + 1 {
        return None;
    }
    (left..n - right)
        .rev()
        .find(|&i| is_pivot(values, i, left, right, low))
        .map(|i| values[i])
}

pub fn swing_lows(candles: &[Candle], left: usize, right: usize) -> Vec<SwingPoint> {
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    pivots(&lows, left, right, true)
}

pub fn swing_highs(candles: &[Candle], left: usize, right: usize) -> Vec<SwingPoint> {
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    pivots(&highs, left, right, false)
}

/// Price of the most recent confirmed swing low.
pub fn latest_swing_low(candles: &[Candle], left: usize, right: usize) -> Option<f64> {
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    latest_pivot(&lows, left, right, true)
}

/// Price of the most recent confirmed swing high.
pub fn latest_swing_high(candles: &[Candle], left: usize, right: usize) -> Option<f64> {
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    latest_pivot(&highs, left, right, false)
}
