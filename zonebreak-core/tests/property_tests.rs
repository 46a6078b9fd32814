//! Property tests for risk and zone invariants.
//!
//! 1. Trailing stop monotonicity: a long stop never falls, a short stop never rises
//! 2. Sizing: loss at the stop equals the budget unless leverage caps it
//! 3. Band fit: the tightest band always contains the required share of closes
//! 4. Qualification: every zone the tracker qualifies meets every rule at that bar

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use zonebreak_core::domain::{Candle, Side, Timeframe, ZoneId};
use zonebreak_core::risk::{position_size, RiskManager, RiskParams};
use zonebreak_core::zones::{tightest_band, EntrySignal, SymbolTracker, ZoneEvent, ZoneParams};

// ── Strategies ───────────────────────────────────────────────────────

/// Random walk of (open, high, low, close) around 100.
fn arb_path(n: usize) -> impl Strategy<Value = Vec<(f64, f64, f64, f64)>> {
    prop::collection::vec((-1.5..1.5_f64, 0.0..1.0_f64, 0.0..1.0_f64), n).prop_map(|steps| {
        let mut price = 100.0;
        steps
            .into_iter()
            .map(|(delta, up, dn)| {
                let open = price;
                let close = (price + delta).max(1.0);
                price = close;
                (open, open.max(close) + up, (open.min(close) - dn).max(0.5), close)
            })
            .collect()
    })
}

/// Choppy range around 100: `spread` scales the noise, wicks are random.
/// Wide spreads rarely qualify, narrow ones usually do.
fn arb_range_path() -> impl Strategy<Value = Vec<(f64, f64, f64, f64)>> {
    (
        0.05..2.5_f64,
        prop::collection::vec((-1.0..1.0_f64, 0.0..1.2_f64, 0.0..1.2_f64), 60..220),
    )
        .prop_map(|(spread, steps)| {
            let mut prev = 100.0;
            steps
                .into_iter()
                .map(|(noise, up, dn)| {
                    let open = prev;
                    let close = 100.0 + spread * noise;
                    prev = close;
                    (open, open.max(close) + up, open.min(close) - dn, close)
                })
                .collect()
        })
}

fn candle(bar: i64, (open, high, low, close): (f64, f64, f64, f64)) -> Candle {
    Candle {
        symbol: "BTCUSDT".into(),
        timeframe: Timeframe::M5,
        open_time: Utc.timestamp_opt(bar * 300, 0).unwrap(),
        open,
        high,
        low,
        close,
        volume: 1.0,
    }
}

fn signal(side: Side, entry: f64, stop: f64) -> EntrySignal {
    EntrySignal {
        symbol: "BTCUSDT".into(),
        zone_id: ZoneId(1),
        side,
        entry_price: entry,
        stop_price: stop,
        bar_index: 0,
        signal_time: Utc.timestamp_opt(300, 0).unwrap(),
        zone_top: entry,
        zone_bottom: entry,
        breakout_level: entry,
        dwell_bars: 18,
        touches: 3,
    }
}

// ── 1. Trailing stop monotonicity ────────────────────────────────────

proptest! {
    #[test]
    fn trailing_stop_never_loosens(path in arb_path(80), long in any::<bool>()) {
        let side = if long { Side::Long } else { Side::Short };
        let rm = RiskManager::new(RiskParams::default());
        // wide initial stop so the walk rarely exits early
        let stop = if long { 60.0 } else { 140.0 };
        let position = rm.plan(&signal(side, 100.0, stop), 100.0, 10_000.0, true).unwrap();
        rm.open(position).unwrap();

        let candles: Vec<Candle> = path.into_iter().enumerate().map(|(i, p)| candle(i as i64 + 1, p)).collect();
        let mut previous = stop;
        for i in 0..candles.len() {
            if rm.on_candle(&candles[i], &candles[..=i]).is_some() {
                break;
            }
            let current = rm.book().get("BTCUSDT").unwrap().trailing_stop_price;
            match side {
                Side::Long => prop_assert!(current >= previous, "long stop fell {} -> {}", previous, current),
                Side::Short => prop_assert!(current <= previous, "short stop rose {} -> {}", previous, current),
            }
            previous = current;
        }
    }
}

// ── 2. Sizing ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn loss_at_stop_is_bounded_by_budget(
        balance in 100.0..1_000_000.0_f64,
        pct in 0.5..10.0_f64,
        entry in 1.0..1_000.0_f64,
        dist_frac in 0.001..0.2_f64,
        leverage in 1.0..20.0_f64,
    ) {
        let stop = entry * (1.0 - dist_frac);
        let size = position_size(balance, pct, entry, stop, leverage).unwrap();
        let loss = size * (entry - stop);
        let budget = balance * pct / 100.0;
        prop_assert!(loss <= budget * (1.0 + 1e-9));
        prop_assert!(size * entry <= balance * leverage * (1.0 + 1e-9));
        // either the budget or the leverage cap binds
        let budget_binds = (loss - budget).abs() <= budget * 1e-9;
        let cap_binds = (size * entry - balance * leverage).abs() <= balance * leverage * 1e-9;
        prop_assert!(budget_binds || cap_binds);
    }
}

// ── 3. Band fit ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn tightest_band_contains_needed_closes(
        closes in prop::collection::vec(50.0..150.0_f64, 12),
        needed in 1usize..=12,
    ) {
        let (top, bottom) = tightest_band(&closes, needed).unwrap();
        prop_assert!(top >= bottom);
        let inside = closes.iter().filter(|c| **c >= bottom && **c <= top).count();
        prop_assert!(inside >= needed);
    }
}

// ── 4. Qualification ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn qualified_zones_meet_every_rule(path in arb_range_path()) {
        let params = ZoneParams::default();
        let mut tracker = SymbolTracker::new("BTCUSDT", params.clone());
        for (i, ohlc) in path.into_iter().enumerate() {
            let bar = i as i64;
            let events = tracker.on_candle(candle(bar, ohlc));
            for event in &events {
                let ZoneEvent::Qualified { zone_id } = event else {
                    continue;
                };
                let zone = tracker.active_zone().expect("qualified zone stays active for its bar");
                prop_assert_eq!(zone.id, *zone_id);
                prop_assert_eq!(zone.qualified_at, Some(bar));
                prop_assert!(zone.dwell_bars >= params.dwell_bars);
                prop_assert!(zone.width() <= params.atr_tight_mult * zone.atr_at_detection);
                prop_assert!(
                    zone.edge_ready(zonebreak_core::zones::Edge::Top, &params)
                        || zone.edge_ready(zonebreak_core::zones::Edge::Bottom, &params)
                );
                prop_assert!(zone.qualifies(&params));
            }
        }
    }
}
