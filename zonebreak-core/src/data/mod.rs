//! Market data: feed trait, Binance klines, CSV cache, universe selection.

pub mod binance;
pub mod cache;
pub mod circuit_breaker;
pub mod provider;
pub mod synthetic;
pub mod universe;

pub use binance::BinanceKlineFeed;
pub use cache::CsvCandleCache;
pub use circuit_breaker::{CircuitBreaker, Verdict};
pub use provider::{DataError, MarketDataFeed};
pub use synthetic::synthetic_candles;
pub use universe::{default_symbols, normalize_symbol, resolve_universe, DEFAULT_SYMBOLS};
