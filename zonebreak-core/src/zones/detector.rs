//! Consolidation band detection over a symbol's rolling 5-minute window.
//!
//! 1. Require `min_history_bars` candles and a warmed-up ATR.
//! 2. Band = tightest interval holding `ceil(close_fraction * lookback)` of the
//!    last `lookback` closes.
//! 3. Reject bands wider than `atr_tight_mult * ATR`.
//! 4. Dwell = trailing run of closes inside the band widened by the touch buffer.
//! 5. Touches are scanned over the dwell run with per-edge separation.

use super::zone::{Edge, Touch};
use super::ZoneParams;
use crate::domain::Candle;

/// A band the detector proposes. The tracker decides whether it becomes a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneCandidate {
    pub top: f64,
    pub bottom: f64,
    pub first_bar: i64,
    pub last_touch_bar: i64,
    pub touches: Vec<Touch>,
    pub dwell_bars: usize,
    pub atr: f64,
}

/// Tightest `[bottom, top]` containing `needed` of `closes`.
pub fn tightest_band(closes: &[f64], needed: usize) -> Option<(f64, f64)> {
    if needed == 0 || closes.len() < needed || closes.iter().any(|c| !c.is_finite()) {
        return None;
    }
    let mut sorted = closes.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut best: Option<(f64, f64)> = None;
    for i in 0..=sorted.len() - needed {
        let (lo, hi) = (sorted[i], sorted[i + needed - 1]);
        match best {
            Some((b_lo, b_hi)) if hi - lo >= b_hi - b_lo => {}
            _ => best = Some((lo, hi)),
        }
    }
    best.map(|(lo, hi)| (hi, lo))
}

/// Detect at most one candidate.
///
/// `history_len` is the tracker's full window length; `window` is the part of
/// it eligible for detection (after the last retirement and cooldown).
pub fn detect(
    window: &[Candle],
    history_len: usize,
    atr: Option<f64>,
    params: &ZoneParams,
) -> Option<ZoneCandidate> {
    let atr = atr.filter(|a| a.is_finite() && *a > 0.0)?;
    if history_len < params.min_history_bars || window.len() < params.lookback_bars {
        return None;
    }

    let recent: Vec<f64> = window[window.len() - params.lookback_bars..]
        .iter()
        .map(|c| c.close)
        .collect();
    let needed = ((params.close_fraction * params.lookback_bars as f64).ceil() as usize)
        .clamp(1, params.lookback_bars);
    let (top, bottom) = tightest_band(&recent, needed)?;

    if top - bottom > params.atr_tight_mult * atr {
        return None;
    }

    let buffer = params.touch_buffer_frac * atr;
    let dwell_bars = window
        .iter()
        .rev()
        .take_while(|c| c.close >= bottom - buffer && c.close <= top + buffer)
        .count();
    if dwell_bars == 0 {
        return None;
    }

    let run = &window[window.len() - dwell_bars..];
    let first_bar = run[0].bar_index();
    let mut touches: Vec<Touch> = Vec::new();
    let mut last_top: Option<i64> = None;
    let mut last_bottom: Option<i64> = None;
    let sep = params.touch_separation_bars as i64;

    for c in run {
        let bar = c.bar_index();
        if c.high >= top - buffer && last_top.map_or(true, |p| bar - p >= sep) {
            touches.push(Touch {
                bar_index: bar,
                price: c.high,
                edge: Edge::Top,
            });
            last_top = Some(bar);
        }
        if c.low <= bottom + buffer && last_bottom.map_or(true, |p| bar - p >= sep) {
            touches.push(Touch {
                bar_index: bar,
                price: c.low,
                edge: Edge::Bottom,
            });
            last_bottom = Some(bar);
        }
    }

    let last_touch_bar = touches.iter().map(|t| t.bar_index).max().unwrap_or(first_bar);

    Some(ZoneCandidate {
        top,
        bottom,
        first_bar,
        last_touch_bar,
        touches,
        dwell_bars,
        atr,
    })
}
