//! What happens to a trigger that arrives while the position cap is full.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Candle, Side};
use crate::zones::EntrySignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapRejectionPolicy {
    /// Drop the trigger; the zone is already retired.
    #[default]
    Retire,
    /// Park the trigger and retry it on later candles of the same symbol.
    Requeue,
}

impl FromStr for CapRejectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retire" => Ok(Self::Retire),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown cap rejection policy '{other}'")),
        }
    }
}

impl fmt::Display for CapRejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retire => f.write_str("retire"),
            Self::Requeue => f.write_str("requeue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParkedEntry {
    pub signal: EntrySignal,
    pub bars_waited: usize,
}

/// Triggers parked under [`CapRejectionPolicy::Requeue`], one per symbol.
#[derive(Debug, Clone, Default)]
pub struct PendingEntries {
    window_bars: usize,
    parked: BTreeMap<String, ParkedEntry>,
}

impl PendingEntries {
    pub fn new(window_bars: usize) -> Self {
        Self {
            window_bars,
            parked: BTreeMap::new(),
        }
    }

    /// Park `signal`, replacing any older trigger for the same symbol.
    pub fn park(&mut self, signal: EntrySignal) {
        debug!(symbol = %signal.symbol, zone = %signal.zone_id, "trigger parked at position cap");
        self.parked.insert(
            signal.symbol.clone(),
            ParkedEntry {
                signal,
                bars_waited: 0,
            },
        );
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.parked.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub fn remove(&mut self, symbol: &str) -> Option<ParkedEntry> {
        self.parked.remove(symbol)
    }

    /// Age the parked trigger for `candle.symbol` by one bar.
    ///
    /// Returns a refreshed signal (entry at this close, stop at this candle's
    /// extreme) while the close holds beyond the breakout level and the window
    /// has not elapsed. Otherwise the trigger is dropped. The caller removes
    /// the entry once it opens.
    pub fn on_candle(&mut self, candle: &Candle) -> Option<EntrySignal> {
        let entry = self.parked.get_mut(&candle.symbol)?;
        if candle.bar_index() <= entry.signal.bar_index {
            return None;
        }
        entry.bars_waited += 1;
        let holds = match entry.signal.side {
            Side::Long => candle.close > entry.signal.breakout_level,
            Side::Short => candle.close < entry.signal.breakout_level,
        };
        if entry.bars_waited > self.window_bars || !holds {
            debug!(
                symbol = %candle.symbol,
                bars_waited = entry.bars_waited,
                holds,
                "parked trigger dropped"
            );
            self.parked.remove(&candle.symbol);
            return None;
        }
        let signal = &mut entry.signal;
        signal.entry_price = candle.close;
        signal.stop_price = match signal.side {
            Side::Long => candle.low,
            Side::Short => candle.high,
        };
        signal.bar_index = candle.bar_index();
        signal.signal_time = candle.close_time();
        Some(signal.clone())
    }
}
