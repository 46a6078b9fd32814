//! Binance USDⓈ-M futures kline feed.
//!
//! Pages through `/fapi/v1/klines`, drops the still-open candle, and guards
//! every request with the shared [`CircuitBreaker`]. Public endpoints only; no
//! signing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, Verdict};
use super::provider::{DataError, MarketDataFeed};
use crate::domain::{Candle, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Binance caps a klines page at 1500 rows.
const MAX_PAGE: usize = 1500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    quote_volume: String,
}

pub struct BinanceKlineFeed {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl BinanceKlineFeed {
    pub fn new(
        base_url: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    fn klines_url(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> String {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={symbol}&interval={}&limit={limit}",
            self.base_url,
            timeframe.code()
        );
        if let Some(s) = start_ms {
            url.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_ms {
            url.push_str(&format!("&endTime={e}"));
        }
        url
    }

    /// GET `url` and decode JSON, with retry, backoff and breaker accounting.
    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                std::thread::sleep(delay);
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status();
                    match self.circuit_breaker.record_status(status.as_u16()) {
                        Verdict::Refuse => return Err(DataError::CircuitBreakerTripped),
                        Verdict::Retry if status == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                            let retry_after = resp
                                .headers()
                                .get("retry-after")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.parse::<u64>().ok())
                                .unwrap_or(60);
                            warn!(what, retry_after, "rate limited");
                            last_error = Some(DataError::RateLimited {
                                retry_after_secs: retry_after,
                            });
                            continue;
                        }
                        Verdict::Retry => {
                            last_error = Some(DataError::Other(format!("HTTP {status} for {what}")));
                            continue;
                        }
                        Verdict::Proceed => {}
                    }

                    if status == reqwest::StatusCode::BAD_REQUEST {
                        let body = resp.text().unwrap_or_default();
                        if body.contains("-1121") {
                            return Err(DataError::SymbolNotFound {
                                symbol: what.to_string(),
                            });
                        }
                        return Err(DataError::Other(format!("HTTP 400 for {what}: {body}")));
                    }
                    if !status.is_success() {
                        return Err(DataError::Other(format!("HTTP {status} for {what}")));
                    }

                    return resp.json().map_err(|e| {
                        DataError::ResponseFormatChanged(format!("failed to parse response for {what}: {e}"))
                    });
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(DataError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }

    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, DataError> {
        let url = self.klines_url(symbol, timeframe, start_ms, end_ms, limit);
        let rows: Vec<Value> = self.get_json(&url, symbol)?;
        parse_klines(symbol, timeframe, &rows, Utc::now())
    }
}

/// Decode kline rows, keeping only candles closed by `now`.
pub fn parse_klines(
    symbol: &str,
    timeframe: Timeframe,
    rows: &[Value],
    now: DateTime<Utc>,
) -> Result<Vec<Candle>, DataError> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row
            .as_array()
            .filter(|a| a.len() >= 7)
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("kline row for {symbol}: {row}")))?;
        let open_ms = arr[0]
            .as_i64()
            .ok_or_else(|| DataError::ResponseFormatChanged("kline open time".into()))?;
        let open_time = Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid timestamp: {open_ms}")))?;
        let num = |i: usize| -> Result<f64, DataError> {
            arr[i]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| DataError::ResponseFormatChanged(format!("kline field {i}: {}", arr[i])))
        };
        let candle = Candle {
            symbol: symbol.to_string(),
            timeframe,
            open_time,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
        };
        if candle.close_time() > now {
            debug!(symbol, open_time = %candle.open_time, "dropping open candle");
            continue;
        }
        candles.push(candle);
    }
    Ok(candles)
}

/// USDT symbols ordered by quote volume descending, then name.
fn rank_by_quote_volume(tickers: Vec<Ticker24h>, n: usize) -> Vec<String> {
    let mut usdt: Vec<(String, f64)> = tickers
        .into_iter()
        .filter(|t| t.symbol.ends_with("USDT"))
        .map(|t| {
            let vol = t.quote_volume.parse::<f64>().unwrap_or(0.0);
            (t.symbol, vol)
        })
        .collect();
    usdt.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    usdt.into_iter().take(n).map(|(s, _)| s).collect()
}

impl MarketDataFeed for BinanceKlineFeed {
    fn name(&self) -> &str {
        "binance_futures"
    }

    fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        let end_ms = end.timestamp_millis() - 1;
        let mut next_ms = start.timestamp_millis();
        let mut out: Vec<Candle> = Vec::new();

        while next_ms <= end_ms {
            let page = self.fetch_page(symbol, timeframe, Some(next_ms), Some(end_ms), MAX_PAGE)?;
            let Some(last) = page.last() else { break };
            let advance = last.close_time().timestamp_millis();
            let full = page.len() >= MAX_PAGE;
            for c in page {
                if out.last().map_or(true, |p| c.open_time > p.open_time) {
                    out.push(c);
                }
            }
            if !full || advance <= next_ms {
                break;
            }
            next_ms = advance;
        }
        debug!(symbol, interval = %timeframe, count = out.len(), "fetched candles");
        Ok(out)
    }

    fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataError> {
        // one extra row covers the open candle we drop
        let request = (limit + 1).min(MAX_PAGE);
        let mut candles = self.fetch_page(symbol, timeframe, None, None, request)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    fn top_symbols_by_volume(&self, n: usize) -> Result<Vec<String>, DataError> {
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let tickers: Vec<Ticker24h> = self.get_json(&url, "ticker/24hr")?;
        Ok(rank_by_quote_volume(tickers, n))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
