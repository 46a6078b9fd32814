//! Symbol universe selection.

use tracing::info;

use super::provider::{DataError, MarketDataFeed};

/// Fallback universe when neither explicit symbols nor `UNIVERSE_N` is given.
pub const DEFAULT_SYMBOLS: [&str; 20] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "ADAUSDT", "SOLUSDT", "DOGEUSDT", "TRXUSDT",
    "MATICUSDT", "DOTUSDT", "LTCUSDT", "SHIBUSDT", "AVAXUSDT", "UNIUSDT", "LINKUSDT", "ATOMUSDT",
    "XMRUSDT", "ETCUSDT", "XLMUSDT", "NEARUSDT",
];

/// `btc/usdt`, `BTC-USDT` and `BTCUSDT` all become `BTCUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

pub fn default_symbols() -> Vec<String> {
    DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
}

/// Pick the universe: `universe_n` wins, then explicit symbols, then defaults.
///
/// Duplicates are removed keeping first occurrence.
pub fn resolve_universe(
    explicit: &[String],
    universe_n: Option<usize>,
    feed: Option<&dyn MarketDataFeed>,
) -> Result<Vec<String>, DataError> {
    let raw = match (universe_n, feed) {
        (Some(n), Some(feed)) => {
            let top = feed.top_symbols_by_volume(n)?;
            info!(n, symbols = ?top, "selected top USDT symbols by quote volume");
            top
        }
        _ if !explicit.is_empty() => explicit.to_vec(),
        _ => default_symbols(),
    };
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for s in raw.iter().map(|s| normalize_symbol(s)) {
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    Ok(out)
}
