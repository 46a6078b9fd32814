//! Test doubles and candle fixtures shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use zonebreak_core::data::{DataError, MarketDataFeed};
use zonebreak_core::domain::{Candle, Timeframe};
use zonebreak_core::sync::lock;

/// Rally after the breakout, then a collapse through the stop.
pub const RALLY: [f64; 7] = [102.0, 102.5, 103.0, 103.5, 104.0, 98.0, 97.0];

pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

/// Descent into a tight 99.7..=100.3 range, a breakout close at 101.5 on
/// bar 80, then `tail`.
pub fn breakout_series(symbol: &str, tail: &[f64]) -> Vec<Candle> {
    let pattern = [99.7, 100.0, 100.3, 100.0];
    let mut closes: Vec<f64> = (0..80)
        .map(|i| {
            if i < 40 {
                110.0 - 8.0 * i as f64 / 40.0
            } else {
                pattern[(i - 40) % 4]
            }
        })
        .collect();
    closes.push(101.5);
    closes.extend_from_slice(tail);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                symbol: symbol.to_string(),
                timeframe: Timeframe::M5,
                open_time: base() + Duration::minutes(5 * i as i64),
                open,
                high: open.max(close) + 0.8,
                low: open.min(close) - 0.8,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// Feed serving fixed series. 5-minute series can be revealed a candle at a
/// time to mimic candles closing.
#[derive(Default)]
pub struct ScriptedFeed {
    series: Mutex<BTreeMap<(String, Timeframe), Vec<Candle>>>,
    visible: Mutex<BTreeMap<String, usize>>,
    calls: Mutex<usize>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, candles: Vec<Candle>) {
        if let Some(first) = candles.first() {
            let key = (first.symbol.clone(), first.timeframe);
            lock(&self.series).insert(key, candles);
        }
    }

    /// Expose only the first `n` 5-minute candles of `symbol`.
    pub fn reveal(&self, symbol: &str, n: usize) {
        lock(&self.visible).insert(symbol.to_string(), n);
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

impl MarketDataFeed for ScriptedFeed {
    fn name(&self) -> &str {
        "scripted"
    }

    fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        Ok(self
            .recent_candles(symbol, timeframe, usize::MAX)?
            .into_iter()
            .filter(|c| c.open_time >= start && c.open_time < end)
            .collect())
    }

    fn recent_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, DataError> {
        *lock(&self.calls) += 1;
        let series = lock(&self.series);
        let Some(all) = series.get(&(symbol.to_string(), timeframe)) else {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        };
        let shown = match timeframe {
            Timeframe::M5 => lock(&self.visible).get(symbol).copied().unwrap_or(all.len()),
            _ => all.len(),
        }
        .min(all.len());
        let from = shown.saturating_sub(limit);
        Ok(all[from..shown].to_vec())
    }

    fn top_symbols_by_volume(&self, n: usize) -> Result<Vec<String>, DataError> {
        let series = lock(&self.series);
        let mut symbols: Vec<String> = series.keys().map(|(s, _)| s.clone()).collect();
        symbols.dedup();
        symbols.truncate(n);
        Ok(symbols)
    }
}
