//! Ratchet invariant: stops may tighten, never loosen.
//!
//! Long stops only rise, short stops only fall, whatever the proposal.

use crate::domain::Side;

#[derive(Debug, Clone, PartialEq)]
pub struct RatchetState {
    /// High-water mark for longs, low-water mark for shorts.
    current_level: Option<f64>,
    side: Side,
}

impl RatchetState {
    pub fn new(side: Side) -> Self {
        Self {
            current_level: None,
            side,
        }
    }

    pub fn with_initial_level(side: Side, initial_level: f64) -> Self {
        Self {
            current_level: Some(initial_level),
            side,
        }
    }

    /// Apply a proposed level and return the ratcheted one.
    ///
    /// Non-finite proposals are ignored. The first finite proposal initializes
    /// an empty ratchet.
    pub fn apply(&mut self, proposed: f64) -> Option<f64> {
        if !proposed.is_finite() {
            return self.current_level;
        }
        let next = match (self.current_level, self.side) {
            (None, _) => proposed,
            (Some(current), Side::Long) => current.max(proposed),
            (Some(current), Side::Short) => current.min(proposed),
        };
        self.current_level = Some(next);
        self.current_level
    }

    pub fn current_level(&self) -> Option<f64> {
        self.current_level
    }

    /// True if `proposed` would move the level.
    pub fn would_tighten(&self, proposed: f64) -> bool {
        match (self.current_level, self.side) {
            (None, _) => proposed.is_finite(),
            (Some(current), Side::Long) => proposed > current,
            (Some(current), Side::Short) => proposed < current,
        }
    }
}
