//! Candle loading for backtests.
//!
//! Given a list of symbols and a date range, resolves 5-minute candles with
//! this fallback policy:
//! 1. If the CSV cache covers the range → use it
//! 2. Otherwise, if a feed is available → download, merge into the cache
//! 3. Otherwise, if `synthetic` is set → generate seeded synthetic candles (tagged)
//! 4. Otherwise → fail with a clear error
//!
//! Synthetic data is a developer-only mode; reports built on it say so.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use zonebreak_core::data::{synthetic_candles, CsvCandleCache, DataError, MarketDataFeed};
use zonebreak_core::domain::{Candle, Timeframe};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no cached data for '{symbol}' and no feed available (use --synthetic for synthetic data)")]
    NoCachedDataOffline { symbol: String },

    #[error("no cached data for '{symbol}' and download failed: {reason}")]
    DownloadFailed { symbol: String, reason: String },

    #[error("no candles for '{symbol}' in the requested range")]
    EmptyRange { symbol: String },

    #[error("data error: {0}")]
    Data(#[from] DataError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    Cache,
    Exchange,
    Synthetic,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Generate synthetic candles when nothing else is available.
    pub synthetic: bool,
    /// Re-download even if cached.
    pub force: bool,
}

/// Loaded candles plus provenance.
#[derive(Debug)]
pub struct LoadedData {
    /// Validated 5-minute series per symbol, in `[start, end)`.
    pub candles: BTreeMap<String, Vec<Candle>>,
    pub sources: BTreeMap<String, CandleSource>,
    /// BLAKE3 over every candle, in symbol order.
    pub dataset_hash: String,
    pub has_synthetic: bool,
}

pub fn load_candles(
    symbols: &[String],
    cache: &CsvCandleCache,
    feed: Option<&dyn MarketDataFeed>,
    opts: &LoadOptions,
) -> Result<LoadedData, LoadError> {
    let mut candles: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    let mut sources: BTreeMap<String, CandleSource> = BTreeMap::new();
    let mut has_synthetic = false;

    for symbol in symbols {
        // Step 1: cache
        if !opts.force && cache.covers_range(symbol, Timeframe::M5, opts.start, opts.end) {
            let series = in_range(cache.load(symbol, Timeframe::M5)?, opts);
            info!(symbol = %symbol, candles = series.len(), "loaded from cache");
            candles.insert(symbol.clone(), series);
            sources.insert(symbol.clone(), CandleSource::Cache);
            continue;
        }

        // Step 2: download
        let mut last_error: Option<String> = None;
        if let Some(feed) = feed.filter(|f| f.is_available()) {
            match feed.get_candles(symbol, Timeframe::M5, opts.start, opts.end) {
                Ok(fetched) if !fetched.is_empty() => {
                    cache.write(symbol, Timeframe::M5, &fetched)?;
                    info!(symbol = %symbol, candles = fetched.len(), feed = feed.name(), "downloaded");
                    candles.insert(symbol.clone(), in_range(fetched, opts));
                    sources.insert(symbol.clone(), CandleSource::Exchange);
                    continue;
                }
                Ok(_) => last_error = Some("feed returned no candles".into()),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "download failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        // Step 3: synthetic
        if opts.synthetic {
            warn!(symbol = %symbol, "generating synthetic data, results will be tagged as synthetic");
            let bars = ((opts.end - opts.start).num_seconds() / Timeframe::M5.seconds()).max(0) as usize;
            let series = synthetic_candles(symbol, opts.start, bars, symbol_seed(symbol));
            candles.insert(symbol.clone(), in_range(series, opts));
            sources.insert(symbol.clone(), CandleSource::Synthetic);
            has_synthetic = true;
            continue;
        }

        // Step 4: fail
        return Err(match last_error {
            Some(reason) => LoadError::DownloadFailed {
                symbol: symbol.clone(),
                reason,
            },
            None => LoadError::NoCachedDataOffline {
                symbol: symbol.clone(),
            },
        });
    }

    if let Some((symbol, _)) = candles.iter().find(|(_, series)| series.is_empty()) {
        return Err(LoadError::EmptyRange {
            symbol: symbol.clone(),
        });
    }

    let dataset_hash = compute_dataset_hash(&candles);
    Ok(LoadedData {
        candles,
        sources,
        dataset_hash,
        has_synthetic,
    })
}

fn in_range(series: Vec<Candle>, opts: &LoadOptions) -> Vec<Candle> {
    series
        .into_iter()
        .filter(|c| c.open_time >= opts.start && c.open_time < opts.end)
        .collect()
}

/// Deterministic per-symbol seed.
pub fn symbol_seed(symbol: &str) -> u64 {
    let hash = blake3::hash(symbol.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// BLAKE3 over all candles in symbol order, independent of load order.
pub fn compute_dataset_hash(candles: &BTreeMap<String, Vec<Candle>>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (symbol, series) in candles {
        hasher.update(symbol.as_bytes());
        for c in series {
            hasher.update(&c.open_time.timestamp().to_le_bytes());
            hasher.update(&c.open.to_le_bytes());
            hasher.update(&c.high.to_le_bytes());
            hasher.update(&c.low.to_le_bytes());
            hasher.update(&c.close.to_le_bytes());
            hasher.update(&c.volume.to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}
