//! Zone detection and the breakout/retest lifecycle.

pub mod detector;
pub mod machine;
pub mod tracker;
pub mod zone;

pub use detector::{detect, tightest_band, ZoneCandidate};
pub use machine::{advance, EntrySignal, ZoneEvent};
pub use tracker::SymbolTracker;
pub use zone::{Edge, Touch, Zone, ZoneState, MIN_EDGE_TOUCHES};

use serde::{Deserialize, Serialize};

/// Zone detection and state machine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneParams {
    pub dwell_bars: usize,
    pub touch_separation_bars: usize,
    pub retest_window_bars: usize,
    pub touch_buffer_frac: f64,
    pub breakout_buffer_frac: f64,
    pub atr_tight_mult: f64,
    pub atr_period: usize,
    /// Closes considered when fitting the band.
    pub lookback_bars: usize,
    /// Share of `lookback_bars` closes the band must contain.
    pub close_fraction: f64,
    pub min_history_bars: usize,
    /// Bars after a progressed zone retires before detection resumes.
    pub cooldown_bars: usize,
    /// Candles retained per symbol.
    pub window_bars: usize,
}

impl Default for ZoneParams {
    fn default() -> Self {
        Self {
            dwell_bars: 18,
            touch_separation_bars: 3,
            retest_window_bars: 8,
            touch_buffer_frac: 0.15,
            breakout_buffer_frac: 0.15,
            atr_tight_mult: 0.55,
            atr_period: 14,
            lookback_bars: 12,
            close_fraction: 0.8,
            min_history_bars: 50,
            cooldown_bars: 10,
            window_bars: 500,
        }
    }
}

/// Forming zone with no touches, for tests.
#[cfg(test)]
pub fn test_zone(top: f64, bottom: f64, atr: f64) -> Zone {
    Zone {
        id: crate::domain::ZoneId(1),
        symbol: "BTCUSDT".into(),
        top,
        bottom,
        first_bar: 0,
        last_touch_bar: 0,
        touches: Vec::new(),
        dwell_bars: 0,
        atr_at_detection: atr,
        state: ZoneState::Forming,
        qualified_at: None,
        broke_out_at: None,
        retired_at: None,
    }
}

/// 5-minute candles with fixed wicks around the given closes, for tests.
#[cfg(test)]
pub fn candles_from_closes(closes: &[f64], wick: f64) -> Vec<crate::domain::Candle> {
    use crate::domain::{Candle, Timeframe};
    use chrono::{TimeZone, Utc};
    let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M5,
                open_time: base + chrono::Duration::minutes(5 * i as i64),
                open,
                high: open.max(close) + wick,
                low: open.min(close) - wick,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// A descent from 110 followed by `dwell` candles oscillating in 99.7..=100.3.
#[cfg(test)]
pub fn consolidation_candles(total: usize, dwell: usize) -> Vec<crate::domain::Candle> {
    let lead = total - dwell;
    let pattern = [99.7, 100.0, 100.3, 100.0];
    let closes: Vec<f64> = (0..total)
        .map(|i| {
            if i < lead {
                110.0 - 8.0 * i as f64 / lead.max(1) as f64
            } else {
                pattern[(i - lead) % pattern.len()]
            }
        })
        .collect();
    candles_from_closes(&closes, 0.8)
}
