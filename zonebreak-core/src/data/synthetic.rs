//! Seeded synthetic 5-minute candles for offline runs and tests.
//!
//! The walk alternates between trending legs and tight sideways phases so the
//! zone detector has something to find. Same seed, same series.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Candle, Timeframe};

struct Phase {
    left: usize,
    drift: f64,
    vol: f64,
    /// Mean-reversion target for sideways phases.
    anchor: Option<f64>,
}

impl Phase {
    fn draw(rng: &mut StdRng, price: f64) -> Self {
        let left = rng.gen_range(20..80);
        if rng.gen_bool(0.5) {
            Self {
                left,
                drift: 0.0,
                vol: 0.0008,
                anchor: Some(price),
            }
        } else {
            let drift = if rng.gen_bool(0.5) { 0.0012 } else { -0.0012 };
            Self {
                left,
                drift,
                vol: 0.002,
                anchor: None,
            }
        }
    }
}

/// Generate `bars` closed M5 candles starting at `start` (aligned down to 5 minutes).
pub fn synthetic_candles(symbol: &str, start: DateTime<Utc>, bars: usize, seed: u64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Timeframe::M5.bucket_start(start);
    let mut price: f64 = rng.gen_range(20.0..200.0);
    let mut phase = Phase::draw(&mut rng, price);
    let mut out = Vec::with_capacity(bars);

    for i in 0..bars {
        if phase.left == 0 {
            phase = Phase::draw(&mut rng, price);
        }
        phase.left -= 1;

        let open = price;
        let shock = rng.gen_range(-1.0_f64..1.0) * phase.vol;
        let pull = phase.anchor.map_or(0.0, |a| (a - price) / price * 0.3);
        let close = (open * (1.0 + phase.drift + shock + pull)).max(0.01);
        let wick_up = rng.gen_range(0.0_f64..1.0) * phase.vol * open;
        let wick_dn = rng.gen_range(0.0_f64..1.0) * phase.vol * open;
        let high = open.max(close) + wick_up;
        let low = (open.min(close) - wick_dn).max(0.005);
        out.push(Candle {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M5,
            open_time: start + Duration::seconds(300 * i as i64),
            open,
            high,
            low,
            close,
            volume: rng.gen_range(10.0..1_000.0),
        });
        price = close;
    }
    out
}
