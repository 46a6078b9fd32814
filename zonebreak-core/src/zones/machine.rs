//! Breakout/retest state machine.
//!
//! ```text
//! FORMING ─► QUALIFIED ─► BREAKOUT_DETECTED ─┬─► TRIGGER_ENTRY        (dwell >= DWELL_BARS)
//!    │                                        └─► RETEST_WAIT ─┬─► TRIGGER_ENTRY
//!    └──────────────► BREAKOUT_DETECTED                        └─► EXPIRED
//! any non-terminal ─► INVALIDATED
//! ```
//!
//! `advance` is evaluated once per closed 5-minute candle and depends only on
//! the zone, the candle and the parameters. Buffers scale with the ATR frozen
//! at detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::zone::{Edge, Touch, Zone, ZoneState};
use super::ZoneParams;
use crate::domain::{Candle, Side, ZoneId};

/// Everything the risk manager needs to size and open a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub zone_id: ZoneId,
    pub side: Side,
    /// Close of the confirming candle.
    pub entry_price: f64,
    /// Extreme of the confirming candle: low for longs, high for shorts.
    pub stop_price: f64,
    pub bar_index: i64,
    pub signal_time: DateTime<Utc>,
    pub zone_top: f64,
    pub zone_bottom: f64,
    /// Close the breakout had to clear: the broken edge plus the breakout buffer.
    pub breakout_level: f64,
    pub dwell_bars: usize,
    pub touches: usize,
}

impl EntrySignal {
    pub fn from_candle(zone: &Zone, candle: &Candle, side: Side, params: &ZoneParams) -> Self {
        let bo = zone.breakout_buffer(params);
        let (stop_price, breakout_level) = match side {
            Side::Long => (candle.low, zone.top + bo),
            Side::Short => (candle.high, zone.bottom - bo),
        };
        Self {
            symbol: zone.symbol.clone(),
            zone_id: zone.id,
            side,
            entry_price: candle.close,
            stop_price,
            bar_index: candle.bar_index(),
            signal_time: candle.close_time(),
            zone_top: zone.top,
            zone_bottom: zone.bottom,
            breakout_level,
            dwell_bars: zone.dwell_bars,
            touches: zone.touches_on(Edge::broken_by(side)),
        }
    }
}

/// Observable lifecycle events, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    Detected { zone_id: ZoneId, top: f64, bottom: f64 },
    Qualified { zone_id: ZoneId },
    DwellReset { zone_id: ZoneId },
    Breakout { zone_id: ZoneId, side: Side, bar_index: i64 },
    RetestStarted { zone_id: ZoneId, side: Side },
    Triggered(EntrySignal),
    Expired { zone_id: ZoneId },
    Invalidated { zone_id: ZoneId, reason: &'static str },
    /// The candle followed a gap and was ingested without evaluation.
    GapSkipped { bar_index: i64 },
}

fn retire(zone: &mut Zone, state: ZoneState, bar: i64) {
    zone.state = state;
    zone.retired_at = Some(bar);
}

fn invalidate(zone: &mut Zone, bar: i64, reason: &'static str, events: &mut Vec<ZoneEvent>) {
    retire(zone, ZoneState::Invalidated, bar);
    events.push(ZoneEvent::Invalidated {
        zone_id: zone.id,
        reason,
    });
}

fn trigger(zone: &mut Zone, candle: &Candle, side: Side, params: &ZoneParams, events: &mut Vec<ZoneEvent>) {
    let signal = EntrySignal::from_candle(zone, candle, side, params);
    retire(zone, ZoneState::TriggerEntry { side }, candle.bar_index());
    events.push(ZoneEvent::Triggered(signal));
}

/// Count a candle inside a qualified band: extend dwell and record touches.
fn absorb(zone: &mut Zone, candle: &Candle, tb: f64, separation: usize) {
    zone.dwell_bars += 1;
    let bar = candle.bar_index();
    if candle.high >= zone.top - tb {
        zone.register_touch(
            Touch {
                bar_index: bar,
                price: candle.high,
                edge: Edge::Top,
            },
            separation,
        );
    }
    if candle.low <= zone.bottom + tb {
        zone.register_touch(
            Touch {
                bar_index: bar,
                price: candle.low,
                edge: Edge::Bottom,
            },
            separation,
        );
    }
}

/// Advance `zone` by one closed candle.
pub fn advance(zone: &mut Zone, candle: &Candle, params: &ZoneParams) -> Vec<ZoneEvent> {
    let mut events = Vec::new();
    let bo = zone.breakout_buffer(params);
    let tb = zone.touch_buffer(params);
    let bar = candle.bar_index();
    let close = candle.close;

    match zone.state {
        ZoneState::Forming | ZoneState::Qualified => {
            let breakout = if close > zone.top + bo {
                Some(Side::Long)
            } else if close < zone.bottom - bo {
                Some(Side::Short)
            } else {
                None
            };

            if let Some(side) = breakout {
                if !zone.edge_ready(Edge::broken_by(side), params) {
                    invalidate(zone, bar, "broke an edge without enough touches", &mut events);
                    return events;
                }
                zone.state = ZoneState::BreakoutDetected {
                    side,
                    breakout_bar: bar,
                };
                zone.broke_out_at = Some(bar);
                events.push(ZoneEvent::Breakout {
                    zone_id: zone.id,
                    side,
                    bar_index: bar,
                });
                if zone.dwell_bars >= params.dwell_bars {
                    trigger(zone, candle, side, params, &mut events);
                } else {
                    zone.state = ZoneState::RetestWait {
                        side,
                        breakout_bar: bar,
                        bars_waited: 0,
                        pulled_back: false,
                    };
                    events.push(ZoneEvent::RetestStarted {
                        zone_id: zone.id,
                        side,
                    });
                }
                return events;
            }

            let inside = close >= zone.bottom - tb && close <= zone.top + tb;
            match (zone.state, inside) {
                (ZoneState::Qualified, true) => absorb(zone, candle, tb, params.touch_separation_bars),
                (ZoneState::Qualified, false) => {
                    zone.dwell_bars = 0;
                    events.push(ZoneEvent::DwellReset { zone_id: zone.id });
                }
                (ZoneState::Forming, false) => {
                    invalidate(zone, bar, "closed outside the band", &mut events);
                }
                // Forming zones are refreshed by the detector.
                _ => {}
            }
        }

        ZoneState::RetestWait {
            side,
            breakout_bar,
            bars_waited,
            pulled_back,
        } => {
            let waited = bars_waited + 1;
            let (back_inside, touched_edge, confirmed) = match side {
                Side::Long => (
                    close < zone.top - bo,
                    candle.low <= zone.top + tb,
                    close > zone.top + bo,
                ),
                Side::Short => (
                    close > zone.bottom + bo,
                    candle.high >= zone.bottom - tb,
                    close < zone.bottom - bo,
                ),
            };
            let pulled_back = pulled_back || touched_edge;

            if back_inside {
                invalidate(zone, bar, "closed back inside before retest confirmed", &mut events);
            } else if pulled_back && confirmed {
                trigger(zone, candle, side, params, &mut events);
            } else if waited >= params.retest_window_bars {
                retire(zone, ZoneState::Expired, bar);
                events.push(ZoneEvent::Expired { zone_id: zone.id });
            } else {
                zone.state = ZoneState::RetestWait {
                    side,
                    breakout_bar,
                    bars_waited: waited,
                    pulled_back,
                };
            }
        }

        // Resolved within the candle that produced it.
        ZoneState::BreakoutDetected { .. } => {}

        ZoneState::TriggerEntry { .. } | ZoneState::Expired | ZoneState::Invalidated => {}
    }

    events
}
