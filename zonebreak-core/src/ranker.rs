//! Priority ranking of qualified zones across the universe.
//!
//! score = touches on the stronger edge / band width. Narrow, well-tested
//! bands rank first. The score decides scheduling order only; it never
//! affects whether a zone triggers.

use serde::{Deserialize, Serialize};

use crate::domain::ZoneId;
use crate::zones::Zone;

/// Widths below this are clamped so a degenerate band cannot divide by zero.
pub const MIN_WIDTH: f64 = 1e-9;

/// Rebuilt every scan cycle; `zone_id` is a lookup key only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub zone_id: ZoneId,
    pub priority_score: f64,
}

pub fn priority_score(zone: &Zone) -> f64 {
    zone.max_touches() as f64 / zone.width().max(MIN_WIDTH)
}

/// Sort by score descending, symbol ascending on ties.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.priority_score
            .total_cmp(&a.priority_score)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    candidates
}
