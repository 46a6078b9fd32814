//! Market data feed trait and its error type.
//!
//! The live monitor and the `fetch` command only see [`MarketDataFeed`], so the
//! Binance client, the CSV cache and test doubles are interchangeable.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Candle, CandleError, Timeframe};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by exchange (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: exchange is refusing requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("no cached data for '{symbol}' ({interval}), run `zonebreak fetch` first")]
    NoCachedData { symbol: String, interval: String },

    #[error("{symbol}: {have} candles, need {need}")]
    InsufficientHistory {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("invalid candle series: {0}")]
    Invalid(#[from] CandleError),

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    /// Missing or short data only skips the symbol for the current cycle.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            DataError::SymbolNotFound { .. }
                | DataError::NoCachedData { .. }
                | DataError::InsufficientHistory { .. }
        )
    }
}

/// Source of closed candles.
///
/// Implementations return candles in strictly increasing `open_time` and
/// never return a candle that has not closed yet.
pub trait MarketDataFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Closed candles with `start <= open_time < end`.
    fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;

    /// The most recent `limit` closed candles.
    fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataError>;

    /// USDT pairs by 24h quote volume, largest first.
    fn top_symbols_by_volume(&self, n: usize) -> Result<Vec<String>, DataError>;

    fn is_available(&self) -> bool {
        true
    }
}
