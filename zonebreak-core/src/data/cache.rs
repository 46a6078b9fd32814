//! CSV candle cache.
//!
//! Layout: `{data_dir}/{SYMBOL}_{interval}.csv`, one row per closed candle,
//! header `open_time,open,high,low,close,volume` with RFC 3339 UTC times.
//! Writes merge with what is already cached and land atomically (write to
//! `.tmp`, rename into place).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{DataError, MarketDataFeed};
use crate::domain::{validate_series, Candle, Timeframe};

#[derive(Debug, Serialize, Deserialize)]
struct CandleRow {
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Clone)]
pub struct CsvCandleCache {
    data_dir: PathBuf,
}

impl CsvCandleCache {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{}.csv", timeframe.code()))
    }

    /// Every cached candle for `symbol`, validated as a strictly increasing series.
    pub fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>, DataError> {
        let path = self.path_for(symbol, timeframe);
        if !path.exists() {
            return Err(DataError::NoCachedData {
                symbol: symbol.to_string(),
                interval: timeframe.code().to_string(),
            });
        }
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| DataError::CacheError(format!("open {}: {e}", path.display())))?;
        let mut candles = Vec::new();
        for record in reader.deserialize::<CandleRow>() {
            let row = record.map_err(|e| DataError::CacheError(format!("{}: {e}", path.display())))?;
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                open_time: row.open_time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        validate_series(symbol, timeframe, &candles)?;
        Ok(candles)
    }

    /// Merge `candles` into the cache file. Newer rows win on equal `open_time`.
    pub fn write(&self, symbol: &str, timeframe: Timeframe, candles: &[Candle]) -> Result<usize, DataError> {
        if candles.is_empty() {
            return Err(DataError::CacheError("no candles to cache".into()));
        }
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| DataError::CacheError(format!("failed to create dir: {e}")))?;

        let mut merged: BTreeMap<DateTime<Utc>, Candle> = match self.load(symbol, timeframe) {
            Ok(existing) => existing.into_iter().map(|c| (c.open_time, c)).collect(),
            Err(DataError::NoCachedData { .. }) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        for c in candles {
            merged.insert(c.open_time, c.clone());
        }
        let merged: Vec<Candle> = merged.into_values().collect();
        validate_series(symbol, timeframe, &merged)?;

        let path = self.path_for(symbol, timeframe);
        let tmp_path = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path)
                .map_err(|e| DataError::CacheError(format!("create {}: {e}", tmp_path.display())))?;
            for c in &merged {
                writer
                    .serialize(CandleRow {
                        open_time: c.open_time,
                        open: c.open,
                        high: c.high,
                        low: c.low,
                        close: c.close,
                        volume: c.volume,
                    })
                    .map_err(|e| DataError::CacheError(format!("write row: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| DataError::CacheError(format!("flush: {e}")))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::CacheError(format!("atomic rename failed: {e}"))
        })?;
        debug!(symbol, interval = %timeframe, rows = merged.len(), "cache written");
        Ok(merged.len())
    }

    /// True if the cached series spans `[start, end)`.
    pub fn covers_range(&self, symbol: &str, timeframe: Timeframe, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.load(symbol, timeframe) {
            Ok(c) => match (c.first(), c.last()) {
                (Some(first), Some(last)) => first.open_time <= start && last.close_time() >= end,
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Symbols with a cache file for `timeframe`, alphabetical.
    pub fn cached_symbols(&self, timeframe: Timeframe) -> Vec<String> {
        let suffix = format!("_{}.csv", timeframe.code());
        let Ok(entries) = fs::read_dir(&self.data_dir) else {
            return Vec::new();
        };
        let mut symbols: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter_map(|name| name.strip_suffix(&suffix).map(str::to_string))
            .collect();
        symbols.sort();
        symbols
    }
}

impl MarketDataFeed for CsvCandleCache {
    fn name(&self) -> &str {
        "csv_cache"
    }

    fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        Ok(self
            .load(symbol, timeframe)?
            .into_iter()
            .filter(|c| c.open_time >= start && c.open_time < end)
            .collect())
    }

    fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataError> {
        let mut candles = self.load(symbol, timeframe)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    /// Offline there is no volume ranking; cached 5m symbols stand in.
    fn top_symbols_by_volume(&self, n: usize) -> Result<Vec<String>, DataError> {
        let mut symbols = self.cached_symbols(Timeframe::M5);
        symbols.truncate(n);
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(bar: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            open_time: Utc.timestamp_opt(bar * 300, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 3.0,
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CsvCandleCache::new(dir.path());
        let input: Vec<Candle> = (0..5).map(|i| candle(i, 100.0 + i as f64)).collect();
        cache.write("BTCUSDT", Timeframe::M5, &input).unwrap();
        assert!(cache.path_for("BTCUSDT", Timeframe::M5).ends_with("BTCUSDT_5m.csv"));
        assert_eq!(cache.load("BTCUSDT", Timeframe::M5).unwrap(), input);
    }

    #[test]
    fn writes_merge_and_newer_rows_win() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CsvCandleCache::new(dir.path());
        cache.write("BTCUSDT", Timeframe::M5, &[candle(0, 1.0), candle(1, 2.0)]).unwrap();
        let rows = cache.write("BTCUSDT", Timeframe::M5, &[candle(1, 5.0), candle(2, 6.0)]).unwrap();
        assert_eq!(rows, 3);
        let loaded = cache.load("BTCUSDT", Timeframe::M5).unwrap();
        assert_eq!(loaded[1].close, 5.0);
    }

    #[test]
    fn missing_file_is_no_cached_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CsvCandleCache::new(dir.path());
        assert!(matches!(
            cache.load("ETHUSDT", Timeframe::H1),
            Err(DataError::NoCachedData { .. })
        ));
    }

    #[test]
    fn feed_range_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CsvCandleCache::new(dir.path());
        let input: Vec<Candle> = (0..10).map(|i| candle(i, 100.0)).collect();
        cache.write("BTCUSDT", Timeframe::M5, &input).unwrap();
        let start = Utc.timestamp_opt(600, 0).unwrap();
        let end = Utc.timestamp_opt(1500, 0).unwrap();
        let ranged = cache.get_candles("BTCUSDT", Timeframe::M5, start, end).unwrap();
        assert_eq!(ranged.len(), 3);
        assert_eq!(cache.recent_candles("BTCUSDT", Timeframe::M5, 4).unwrap()[0].bar_index(), 6);
        assert!(cache.covers_range("BTCUSDT", Timeframe::M5, start, end));
        assert_eq!(cache.top_symbols_by_volume(5).unwrap(), vec!["BTCUSDT"]);
    }

    #[test]
    fn corrupt_series_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CsvCandleCache::new(dir.path());
        let path = cache.path_for("BTCUSDT", Timeframe::M5);
        fs::write(
            &path,
            "open_time,open,high,low,close,volume\n\
             1970-01-01T00:05:00Z,1,2,0.5,1,1\n\
             1970-01-01T00:00:00Z,1,2,0.5,1,1\n",
        )
        .unwrap();
        assert!(matches!(
            cache.load("BTCUSDT", Timeframe::M5),
            Err(DataError::Invalid(_))
        ));
    }
}
