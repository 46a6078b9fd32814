//! One pass over one symbol, shared by the scanner and the monitor tick.

use std::ops::AddAssign;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use zonebreak_core::data::DataError;
use zonebreak_core::domain::{Candle, Timeframe};
use zonebreak_core::risk::{CapRejectionPolicy, Rejection};
use zonebreak_core::sync::lock;
use zonebreak_core::trend::trend_aligned;
use zonebreak_core::zones::{EntrySignal, SymbolTracker, ZoneEvent};

use super::execution::EntryError;
use super::SharedState;

/// What one evaluation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvalOutcome {
    pub ingested: usize,
    pub triggers: usize,
    pub stale: usize,
    pub entries: usize,
    pub rejections: usize,
    pub parked: usize,
    pub exits: usize,
}

impl AddAssign for EvalOutcome {
    fn add_assign(&mut self, other: Self) {
        self.ingested += other.ingested;
        self.triggers += other.triggers;
        self.stale += other.stale;
        self.entries += other.entries;
        self.rejections += other.rejections;
        self.parked += other.parked;
        self.exits += other.exits;
    }
}

/// Fetch, fold new candles into the tracker, manage the open position and
/// route triggers.
///
/// The symbol's tracker stays locked for the whole pass, so two passes over
/// the same symbol never interleave.
pub fn evaluate_symbol(state: &SharedState, symbol: &str) -> Result<EvalOutcome, DataError> {
    let shared = state.registry.tracker(symbol);
    let mut tracker = lock(&shared);
    let history = state.settings.history_bars;
    let last_bar = tracker.last_bar();
    let first_fetch = last_bar.is_none();

    let limit = match last_bar {
        None => history,
        Some(last) => {
            let now_bar = Utc::now().timestamp() / Timeframe::M5.seconds();
            let gap = (now_bar - last).max(1) as usize;
            (gap + 1).min(history)
        }
    };
    let fresh: Vec<Candle> = state
        .feed
        .recent_candles(symbol, Timeframe::M5, limit)?
        .into_iter()
        .filter(|c| last_bar.map_or(true, |b| c.bar_index() > b))
        .collect();
    let newest = fresh.last().map(Candle::bar_index);

    let requeue = state.risk.params().cap_rejection_policy == CapRejectionPolicy::Requeue;
    let mut outcome = EvalOutcome::default();

    for candle in fresh {
        let stale = first_fetch && Some(candle.bar_index()) != newest;
        let events = tracker.on_candle(candle.clone());
        outcome.ingested += 1;

        if state.risk.book().contains(symbol) {
            let recent = tracker.recent_candles(tracker.window_len());
            match state.risk.on_candle(&candle, &recent) {
                Some(exit) => {
                    if state.bridge.exit(&state.risk, &exit).is_some() {
                        outcome.exits += 1;
                    }
                }
                None => state.bridge.sync_stop(&state.risk, symbol),
            }
        }

        if requeue {
            let retry = lock(&state.pending).on_candle(&candle);
            if let Some(signal) = retry.filter(|_| !stale) {
                route(state, &tracker, signal, true, &mut outcome);
            }
        }

        for event in events {
            let ZoneEvent::Triggered(signal) = event else {
                continue;
            };
            outcome.triggers += 1;
            if stale {
                info!(symbol, zone = %signal.zone_id, bar = signal.bar_index, "stale trigger from history replay skipped");
                outcome.stale += 1;
                continue;
            }
            route(state, &tracker, signal, false, &mut outcome);
        }
    }

    if outcome.ingested > 0 {
        debug!(symbol, ingested = outcome.ingested, "symbol evaluated");
    }
    Ok(outcome)
}

/// Hand a trigger to the execution bridge. `retry` marks a parked trigger
/// being re-tried; a retry that hits the cap again stays parked as it was.
/// A filled entry takes its profit targets from the tracker's window.
fn route(
    state: &SharedState,
    tracker: &SymbolTracker,
    signal: EntrySignal,
    retry: bool,
    outcome: &mut EvalOutcome,
) {
    let symbol = signal.symbol.clone();
    let bias = state.trend.bias(&symbol, state.feed.as_ref());
    let aligned = trend_aligned(signal.side, bias);
    info!(
        symbol = %symbol,
        zone = %signal.zone_id,
        side = %signal.side,
        entry = signal.entry_price,
        stop = signal.stop_price,
        trend_aligned = aligned,
        retry,
        "entry trigger"
    );

    match state.bridge.enter(&state.risk, &signal, aligned) {
        Ok(_) => {
            outcome.entries += 1;
            lock(&state.pending).remove(&symbol);
            state
                .risk
                .attach_targets(&symbol, &tracker.recent_candles(tracker.window_len()));
        }
        Err(EntryError::Rejected(Rejection::CapReached { max }))
            if state.risk.params().cap_rejection_policy == CapRejectionPolicy::Requeue =>
        {
            outcome.rejections += 1;
            if !retry {
                info!(symbol = %symbol, max, "position cap reached, trigger parked");
                lock(&state.pending).park(signal);
                outcome.parked += 1;
            }
        }
        Err(EntryError::Rejected(rejection)) => {
            outcome.rejections += 1;
            lock(&state.pending).remove(&symbol);
            warn!(symbol = %symbol, %rejection, "entry rejected");
        }
        Err(EntryError::Gateway(e)) => {
            lock(&state.pending).remove(&symbol);
            warn!(symbol = %symbol, error = %e, "entry skipped after gateway failure");
        }
    }
}
