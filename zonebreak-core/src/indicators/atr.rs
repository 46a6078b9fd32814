//! Average True Range (ATR), Wilder smoothing.
//!
//! True Range: max(high-low, |high-prev_close|, |low-prev_close|).
//! TR[0] has no previous close and is left NaN, so the seed is mean(TR[1..=period])
//! and the first ATR value lands on index `period`.

use crate::domain::Candle;

/// True Range series. TR[0] is NaN.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let n = candles.len();
    let mut tr = vec![f64::NAN; n];

    for i in 1..n {
        let h = candles[i].high;
        let l = candles[i].low;
        let pc = candles[i - 1].close;
        if h.is_nan() || l.is_nan() || pc.is_nan() {
            continue;
        }
        tr[i] = true_range_step(h, l, pc);
    }

    tr
}

fn true_range_step(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Wilder smoothing (alpha = 1/period) seeded with the mean of the first run
/// of `period` consecutive valid values.
pub fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];

    if n < period || period == 0 {
        return result;
    }

    let mut run = 0usize;
    let mut seed_end = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_nan() {
            run = 0;
            continue;
        }
        run += 1;
        if run == period {
            seed_end = Some(i + 1);
            break;
        }
    }

    let Some(seed_end) = seed_end else {
        return result;
    };

    let seed: f64 = values[seed_end - period..seed_end].iter().sum::<f64>() / period as f64;
    result[seed_end - 1] = seed;

    let alpha = 1.0 / period as f64;
    let mut prev = seed;

    for i in seed_end..n {
        if values[i].is_nan() {
            return result;
        }
        let smoothed = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = smoothed;
        prev = smoothed;
    }

    result
}

/// Wilder ATR over a candle series.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    wilder_smooth(&true_range(candles), period)
}

/// Incremental Wilder ATR.
///
/// Fed the same candles in order, it yields bit-identical values to `atr`.
#[derive(Debug, Clone)]
pub struct AtrState {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Fold one candle in and return the ATR after it (None while warming up).
    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let Some(pc) = self.prev_close.replace(candle.close) else {
            return None;
        };
        let tr = true_range_step(candle.high, candle.low, pc);

        match self.value {
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
            Some(prev) => {
                let alpha = 1.0 / self.period as f64;
                self.value = Some(alpha * tr + (1.0 - alpha) * prev);
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
