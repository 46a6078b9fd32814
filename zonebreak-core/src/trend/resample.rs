//! Aggregate 5-minute candles into higher-timeframe buckets.

use chrono::{DateTime, Utc};

use crate::domain::{Candle, Timeframe};

/// Resample `candles` into `timeframe` buckets.
///
/// Only buckets whose end is at or before `as_of` are emitted; `as_of`
/// defaults to the close of the last input candle. Missing candles inside a
/// bucket are tolerated.
pub fn resample(candles: &[Candle], timeframe: Timeframe, as_of: Option<DateTime<Utc>>) -> Vec<Candle> {
    let Some(last) = candles.last() else {
        return Vec::new();
    };
    let as_of = as_of.unwrap_or_else(|| last.close_time());

    let mut out: Vec<Candle> = Vec::new();
    let mut current: Option<Candle> = None;

    for c in candles {
        let start = timeframe.bucket_start(c.open_time);
        match current.as_mut() {
            Some(agg) if agg.open_time == start => {
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
                agg.volume += c.volume;
            }
            _ => {
                if let Some(done) = current.take() {
                    if done.close_time() <= as_of {
                        out.push(done);
                    }
                }
                current = Some(Candle {
                    symbol: c.symbol.clone(),
                    timeframe,
                    open_time: start,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                });
            }
        }
    }
    if let Some(done) = current {
        if done.close_time() <= as_of {
            out.push(done);
        }
    }
    out
}
