//! Per-symbol tracker: rolling candle window, incremental ATR, the active zone
//! and a bounded history of retired zones.
//!
//! The live monitor and the backtest simulator both drive symbols through
//! `SymbolTracker::on_candle`, one closed 5-minute candle at a time.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::detector::{detect, ZoneCandidate};
use super::machine::{advance, ZoneEvent};
use super::zone::{Zone, ZoneState};
use super::ZoneParams;
use crate::domain::{Candle, Timeframe, ZoneIdGen};
use crate::indicators::AtrState;
use crate::ranker::{priority_score, Candidate};

/// Retired zones kept for inspection.
pub const RETIRED_HISTORY: usize = 32;

#[derive(Debug, Clone)]
pub struct SymbolTracker {
    symbol: String,
    params: ZoneParams,
    window: VecDeque<Candle>,
    atr: AtrState,
    active: Option<Zone>,
    retired: VecDeque<Zone>,
    ids: ZoneIdGen,
    last_bar: Option<i64>,
    /// Detection only looks at candles after this bar.
    detect_after: Option<i64>,
}

impl SymbolTracker {
    pub fn new(symbol: impl Into<String>, params: ZoneParams) -> Self {
        let atr = AtrState::new(params.atr_period);
        Self {
            symbol: symbol.into(),
            window: VecDeque::with_capacity(params.window_bars.min(4096)),
            atr,
            params,
            active: None,
            retired: VecDeque::new(),
            ids: ZoneIdGen::new(),
            last_bar: None,
            detect_after: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn params(&self) -> &ZoneParams {
        &self.params
    }

    pub fn last_bar(&self) -> Option<i64> {
        self.last_bar
    }

    pub fn last_close_time(&self) -> Option<DateTime<Utc>> {
        self.window.back().map(|c| c.close_time())
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr.value()
    }

    pub fn active_zone(&self) -> Option<&Zone> {
        self.active.as_ref()
    }

    /// Retired zones, oldest first.
    pub fn retired(&self) -> impl Iterator<Item = &Zone> {
        self.retired.iter()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// The newest `n` candles, oldest first.
    pub fn recent_candles(&self, n: usize) -> Vec<Candle> {
        let skip = self.window.len().saturating_sub(n);
        self.window.iter().skip(skip).cloned().collect()
    }

    /// Ranking candidate for a qualified, still-live zone.
    pub fn candidate(&self) -> Option<Candidate> {
        let zone = self.active.as_ref()?;
        if zone.state.rank() < ZoneState::Qualified.rank() || zone.state.is_terminal() {
            return None;
        }
        Some(Candidate {
            symbol: self.symbol.clone(),
            zone_id: zone.id,
            priority_score: priority_score(zone),
        })
    }

    /// Fold one closed candle in and return what happened.
    ///
    /// Candles for other symbols or timeframes, and candles at or before the
    /// last processed bar, are ignored. A candle following a gap is ingested
    /// but not evaluated.
    pub fn on_candle(&mut self, candle: Candle) -> Vec<ZoneEvent> {
        if candle.symbol != self.symbol || candle.timeframe != Timeframe::M5 {
            debug!(symbol = %self.symbol, got = %candle.symbol, "ignoring foreign candle");
            return Vec::new();
        }
        let bar = candle.bar_index();
        if self.last_bar.is_some_and(|last| bar <= last) {
            return Vec::new();
        }
        let gap = self.last_bar.is_some_and(|last| bar != last + 1);

        self.atr.update(&candle);
        self.window.push_back(candle);
        while self.window.len() > self.params.window_bars.max(1) {
            self.window.pop_front();
        }
        self.last_bar = Some(bar);

        if gap {
            debug!(symbol = %self.symbol, bar, "gap before candle, skipping evaluation");
            return vec![ZoneEvent::GapSkipped { bar_index: bar }];
        }

        let mut events = Vec::new();
        let Some(candle) = self.window.back().cloned() else {
            return events;
        };

        if let Some(zone) = self.active.as_mut() {
            events.extend(advance(zone, &candle, &self.params));
        }

        if self
            .active
            .as_ref()
            .is_some_and(|z| z.state == ZoneState::Forming)
        {
            self.refresh_forming(bar, &mut events);
        }

        if self.active.as_ref().is_some_and(|z| z.state.is_terminal()) {
            self.retire_active(bar);
        }

        if self.active.is_none() {
            if let Some(cand) = self.detect_now() {
                let zone = self.zone_from(cand);
                info!(
                    symbol = %self.symbol,
                    zone = %zone.id,
                    top = zone.top,
                    bottom = zone.bottom,
                    dwell = zone.dwell_bars,
                    "zone detected"
                );
                events.push(ZoneEvent::Detected {
                    zone_id: zone.id,
                    top: zone.top,
                    bottom: zone.bottom,
                });
                self.active = Some(zone);
                self.promote_if_qualified(bar, &mut events);
            }
        }

        events
    }

    fn detect_now(&mut self) -> Option<ZoneCandidate> {
        let history_len = self.window.len();
        let slice = self.window.make_contiguous();
        let start = match self.detect_after {
            Some(after) => slice.partition_point(|c| c.bar_index() <= after),
            None => 0,
        };
        detect(&slice[start..], history_len, self.atr.value(), &self.params)
    }

    fn zone_from(&mut self, cand: ZoneCandidate) -> Zone {
        Zone {
            id: self.ids.next_id(),
            symbol: self.symbol.clone(),
            top: cand.top,
            bottom: cand.bottom,
            first_bar: cand.first_bar,
            last_touch_bar: cand.last_touch_bar,
            touches: cand.touches,
            dwell_bars: cand.dwell_bars,
            atr_at_detection: cand.atr,
            state: ZoneState::Forming,
            qualified_at: None,
            broke_out_at: None,
            retired_at: None,
        }
    }

    /// Re-fit a FORMING zone to the latest window, or drop it if the band dissolved.
    fn refresh_forming(&mut self, bar: i64, events: &mut Vec<ZoneEvent>) {
        match self.detect_now() {
            Some(cand) => {
                if let Some(zone) = self.active.as_mut() {
                    zone.top = cand.top;
                    zone.bottom = cand.bottom;
                    zone.first_bar = cand.first_bar;
                    zone.last_touch_bar = cand.last_touch_bar;
                    zone.touches = cand.touches;
                    zone.dwell_bars = cand.dwell_bars;
                    zone.atr_at_detection = cand.atr;
                }
                self.promote_if_qualified(bar, events);
            }
            None => {
                if let Some(zone) = self.active.as_mut() {
                    zone.state = ZoneState::Invalidated;
                    zone.retired_at = Some(bar);
                    events.push(ZoneEvent::Invalidated {
                        zone_id: zone.id,
                        reason: "consolidation dissolved",
                    });
                }
            }
        }
    }

    fn promote_if_qualified(&mut self, bar: i64, events: &mut Vec<ZoneEvent>) {
        let Some(zone) = self.active.as_mut() else {
            return;
        };
        if zone.state == ZoneState::Forming && zone.qualifies(&self.params) {
            zone.state = ZoneState::Qualified;
            zone.qualified_at = Some(bar);
            info!(
                symbol = %self.symbol,
                zone = %zone.id,
                touches = zone.max_touches(),
                dwell = zone.dwell_bars,
                "zone qualified"
            );
            events.push(ZoneEvent::Qualified { zone_id: zone.id });
        }
    }

    fn retire_active(&mut self, bar: i64) {
        let Some(zone) = self.active.take() else {
            return;
        };
        let retired_at = zone.retired_at.unwrap_or(bar);
        let cooldown = if zone.progressed() {
            self.params.cooldown_bars as i64
        } else {
            0
        };
        self.detect_after = Some(retired_at + cooldown);
        debug!(symbol = %self.symbol, zone = %zone.id, state = %zone.state, "zone retired");
        self.retired.push_back(zone);
        while self.retired.len() > RETIRED_HISTORY {
            self.retired.pop_front();
        }
    }
}
