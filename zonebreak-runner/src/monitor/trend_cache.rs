//! Aggregate trend bias per symbol, refreshed at most once per TTL.
//!
//! Only consulted when a trigger needs sizing, so a symbol that never
//! triggers never pays for the ladder fetch.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;
use zonebreak_core::data::MarketDataFeed;
use zonebreak_core::domain::{Candle, Timeframe};
use zonebreak_core::sync::lock;
use zonebreak_core::trend::{aggregate, biases_from_series, Direction, TREND_MIN_BARS};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct TrendCache {
    ladder: Vec<Timeframe>,
    slope_lookback: usize,
    ttl: Duration,
    entries: Mutex<BTreeMap<String, (Instant, Direction)>>,
}

impl TrendCache {
    pub fn new(ladder: Vec<Timeframe>, slope_lookback: usize, ttl: Duration) -> Self {
        Self {
            ladder,
            slope_lookback,
            ttl,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Cached bias, or a fresh one from `feed`. Missing data counts as Neutral.
    pub fn bias(&self, symbol: &str, feed: &dyn MarketDataFeed) -> Direction {
        if let Some((at, dir)) = lock(&self.entries).get(symbol) {
            if at.elapsed() < self.ttl {
                return *dir;
            }
        }

        let limit = TREND_MIN_BARS + self.slope_lookback + 1;
        let mut series: Vec<(Timeframe, Vec<Candle>)> = Vec::with_capacity(self.ladder.len());
        for &tf in &self.ladder {
            match feed.recent_candles(symbol, tf, limit) {
                Ok(candles) => series.push((tf, candles)),
                Err(e) => {
                    debug!(symbol, timeframe = %tf, error = %e, "trend data unavailable, treating as neutral");
                    series.push((tf, Vec::new()));
                }
            }
        }
        let biases = biases_from_series(symbol, &series, self.slope_lookback, Utc::now());
        let dir = aggregate(&biases);
        lock(&self.entries).insert(symbol.to_string(), (Instant::now(), dir));
        dir
    }
}
