//! Bounded monitor pool with demotion hysteresis.
//!
//! Rebalanced once per global scan:
//! - members with neither a live candidate nor a contending position leave at once
//! - members that fall outside the top-K leave after `demote_after` consecutive misses
//! - free slots are filled from the top-K in order
//!
//! Positioned symbols contend ahead of zone candidates unless the position
//! cap is full; then the coarse scan manages their exits.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use zonebreak_core::ranker::Candidate;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolChange {
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
}

impl PoolChange {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.demoted.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorPool {
    capacity: usize,
    demote_after: usize,
    /// Member → consecutive scans outside the top-K.
    members: BTreeMap<String, usize>,
}

impl MonitorPool {
    pub fn new(capacity: usize, demote_after: usize) -> Self {
        Self {
            capacity,
            demote_after: demote_after.max(1),
            members: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn members(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.members.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Rebalance against this scan's `ranked` candidates (best first).
    pub fn rebalance(&mut self, ranked: &[Candidate], positioned: &[String], cap_full: bool) -> PoolChange {
        let contending: BTreeSet<&str> = if cap_full {
            BTreeSet::new()
        } else {
            positioned.iter().map(String::as_str).collect()
        };
        let with_candidate: BTreeSet<&str> = ranked.iter().map(|c| c.symbol.as_str()).collect();

        let mut order: Vec<&str> = contending.iter().copied().collect();
        order.extend(
            ranked
                .iter()
                .map(|c| c.symbol.as_str())
                .filter(|s| !contending.contains(s)),
        );
        order.truncate(self.capacity);
        let top_k: BTreeSet<&str> = order.iter().copied().collect();

        let mut change = PoolChange::default();
        let demote_after = self.demote_after;
        self.members.retain(|symbol, misses| {
            let s = symbol.as_str();
            if !with_candidate.contains(s) && !contending.contains(s) {
                change.demoted.push(symbol.clone());
                return false;
            }
            if top_k.contains(s) {
                *misses = 0;
                return true;
            }
            *misses += 1;
            if *misses >= demote_after {
                change.demoted.push(symbol.clone());
                false
            } else {
                true
            }
        });

        for symbol in order {
            if self.members.len() >= self.capacity {
                break;
            }
            if !self.members.contains_key(symbol) {
                self.members.insert(symbol.to_string(), 0);
                change.promoted.push(symbol.to_string());
            }
        }
        change
    }
}
