//! Symbol → tracker map shared by the scanner and the monitor tick.
//!
//! Each tracker sits behind its own mutex, so one symbol's candles are folded
//! strictly in order while different symbols proceed in parallel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use zonebreak_core::ranker::Candidate;
use zonebreak_core::sync::lock;
use zonebreak_core::zones::{SymbolTracker, ZoneParams};

pub type SharedTracker = Arc<Mutex<SymbolTracker>>;

#[derive(Debug)]
pub struct ZoneRegistry {
    params: ZoneParams,
    trackers: Mutex<BTreeMap<String, SharedTracker>>,
}

impl ZoneRegistry {
    pub fn new(params: ZoneParams) -> Self {
        Self {
            params,
            trackers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The tracker for `symbol`, created on first use.
    pub fn tracker(&self, symbol: &str) -> SharedTracker {
        let mut trackers = lock(&self.trackers);
        trackers
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolTracker::new(symbol, self.params.clone()))))
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<SharedTracker> {
        lock(&self.trackers).get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        lock(&self.trackers).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.trackers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ranking candidates for every qualified, live zone.
    ///
    /// The map lock is released before any tracker is locked.
    pub fn candidates(&self) -> Vec<Candidate> {
        let trackers: Vec<SharedTracker> = lock(&self.trackers).values().cloned().collect();
        trackers
            .iter()
            .filter_map(|t| lock(t).candidate())
            .collect()
    }

    /// Last close seen for `symbol`, if any.
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        let tracker = self.get(symbol)?;
        let t = lock(&tracker);
        t.recent_candles(1).first().map(|c| c.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_is_created_once() {
        let registry = ZoneRegistry::new(ZoneParams::default());
        let a = registry.tracker("BTCUSDT");
        let b = registry.tracker("BTCUSDT");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ETHUSDT").is_none());
    }

    #[test]
    fn fresh_trackers_have_no_candidates() {
        let registry = ZoneRegistry::new(ZoneParams::default());
        registry.tracker("BTCUSDT");
        registry.tracker("ETHUSDT");
        assert!(registry.candidates().is_empty());
        assert_eq!(registry.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(registry.last_close("BTCUSDT").is_none());
    }
}
