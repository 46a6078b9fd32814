//! Candle: the fundamental market data unit.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Candle interval. Only `M5` drives the decision engine; the rest feed the trend ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    /// Exchange interval code (`5m`, `1h`, ..., `1M`).
    pub fn code(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::MN1 => "1M",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "5m" => Some(Timeframe::M5),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" | "1D" => Some(Timeframe::D1),
            "1w" | "1W" => Some(Timeframe::W1),
            "1M" => Some(Timeframe::MN1),
            _ => None,
        }
    }

    /// Nominal length in seconds. Months use 30 days; bucketing uses calendar months.
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M5 => 300,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
            Timeframe::MN1 => 2_592_000,
        }
    }

    /// Start of the bucket containing `t`. Weeks start Monday 00:00 UTC.
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let ts = t.timestamp();
        match self {
            Timeframe::M5 | Timeframe::H1 | Timeframe::H4 | Timeframe::D1 => {
                let secs = self.seconds();
                utc(ts - ts.rem_euclid(secs))
            }
            Timeframe::W1 => {
                let day = ts - ts.rem_euclid(86_400);
                let weekday = t.weekday().num_days_from_monday() as i64;
                utc(day - weekday * 86_400)
            }
            Timeframe::MN1 => {
                let first = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0));
                match first {
                    Some(naive) => Utc.from_utc_datetime(&naive),
                    None => t,
                }
            }
        }
    }

    /// End (exclusive) of the bucket starting at `start`.
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::MN1 => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(start + Duration::seconds(self.seconds()))
            }
            _ => start + Duration::seconds(self.seconds()),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

fn utc(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Closed OHLCV candle for one symbol on one timeframe. Immutable once closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timeframe.bucket_end(self.open_time)
    }

    /// Absolute bar number: open time divided by the timeframe length.
    ///
    /// Live and historical runs agree on it, and gaps count as elapsed bars.
    pub fn bar_index(&self) -> i64 {
        self.open_time.timestamp().div_euclid(self.timeframe.seconds())
    }

    /// Returns true if any OHLC field is non-finite.
    pub fn is_void(&self) -> bool {
        !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite())
    }

    /// high >= max(open, close) >= min(open, close) >= low > 0
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.low > 0.0
            && self.volume >= 0.0
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("{symbol}: candle at {at} is not strictly after the previous one")]
    NotIncreasing { symbol: String, at: DateTime<Utc> },

    #[error("{symbol}: candle at {at} has inconsistent OHLC")]
    Insane { symbol: String, at: DateTime<Utc> },

    #[error("{symbol}: expected {expected} candles, found {found} at {at}")]
    WrongTimeframe {
        symbol: String,
        expected: Timeframe,
        found: Timeframe,
        at: DateTime<Utc>,
    },

    #[error("{symbol}: candle at {at} belongs to {found}")]
    WrongSymbol {
        symbol: String,
        found: String,
        at: DateTime<Utc>,
    },
}

/// Check that a series is one symbol, one timeframe, strictly increasing and sane.
pub fn validate_series(
    symbol: &str,
    timeframe: Timeframe,
    candles: &[Candle],
) -> Result<(), CandleError> {
    let mut prev: Option<DateTime<Utc>> = None;
    for c in candles {
        if c.symbol != symbol {
            return Err(CandleError::WrongSymbol {
                symbol: symbol.to_string(),
                found: c.symbol.clone(),
                at: c.open_time,
            });
        }
        if c.timeframe != timeframe {
            return Err(CandleError::WrongTimeframe {
                symbol: symbol.to_string(),
                expected: timeframe,
                found: c.timeframe,
                at: c.open_time,
            });
        }
        if let Some(p) = prev {
            if c.open_time <= p {
                return Err(CandleError::NotIncreasing {
                    symbol: symbol.to_string(),
                    at: c.open_time,
                });
            }
        }
        if !c.is_sane() {
            return Err(CandleError::Insane {
                symbol: symbol.to_string(),
                at: c.open_time,
            });
        }
        prev = Some(c.open_time);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            open_time: utc(ts),
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: 12.5,
        }
    }

    #[test]
    fn candle_is_sane() {
        assert!(sample(0).is_sane());
    }

    #[test]
    fn candle_high_below_close_is_insane() {
        let mut c = sample(0);
        c.high = 102.0;
        assert!(!c.is_sane());
    }

    #[test]
    fn candle_nan_is_void() {
        let mut c = sample(0);
        c.low = f64::NAN;
        assert!(c.is_void());
        assert!(!c.is_sane());
    }

    #[test]
    fn bar_index_counts_five_minute_slots() {
        assert_eq!(sample(0).bar_index(), 0);
        assert_eq!(sample(300).bar_index(), 1);
        assert_eq!(sample(3_000).bar_index(), 10);
    }

    #[test]
    fn close_time_is_open_plus_interval() {
        let c = sample(600);
        assert_eq!(c.close_time().timestamp(), 900);
    }

    #[test]
    fn timeframe_codes_round_trip() {
        for tf in [
            Timeframe::M5,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
            Timeframe::W1,
            Timeframe::MN1,
        ] {
            assert_eq!(Timeframe::from_code(tf.code()), Some(tf));
        }
        assert_eq!(Timeframe::from_code("3m"), None);
    }

    #[test]
    fn week_bucket_starts_monday() {
        // 2024-01-04 is a Thursday
        let t = Utc.with_ymd_and_hms(2024, 1, 4, 13, 5, 0).unwrap();
        let start = Timeframe::W1.bucket_start(t);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            Timeframe::W1.bucket_end(start),
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn month_bucket_rolls_over_year() {
        let t = Utc.with_ymd_and_hms(2023, 12, 19, 8, 0, 0).unwrap();
        let start = Timeframe::MN1.bucket_start(t);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(
            Timeframe::MN1.bucket_end(start),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn validate_rejects_duplicate_open_time() {
        let candles = vec![sample(0), sample(0)];
        assert!(matches!(
            validate_series("BTCUSDT", Timeframe::M5, &candles),
            Err(CandleError::NotIncreasing { .. })
        ));
    }

    #[test]
    fn validate_rejects_wrong_timeframe() {
        let mut c = sample(0);
        c.timeframe = Timeframe::H1;
        assert!(matches!(
            validate_series("BTCUSDT", Timeframe::M5, &[c]),
            Err(CandleError::WrongTimeframe { .. })
        ));
    }

    #[test]
    fn validate_accepts_gaps() {
        let candles = vec![sample(0), sample(300), sample(1_500)];
        assert!(validate_series("BTCUSDT", Timeframe::M5, &candles).is_ok());
    }
}
