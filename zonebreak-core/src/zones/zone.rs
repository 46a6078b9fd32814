//! Zone, touch and lifecycle state types.

use serde::{Deserialize, Serialize};

use super::ZoneParams;
use crate::domain::{Side, ZoneId};

/// Minimum touches on the broken edge for a breakout to count.
pub const MIN_EDGE_TOUCHES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Top,
    Bottom,
}

impl Edge {
    /// The edge a breakout on `side` crosses.
    pub fn broken_by(side: Side) -> Edge {
        match side {
            Side::Long => Edge::Top,
            Side::Short => Edge::Bottom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Touch {
    pub bar_index: i64,
    pub price: f64,
    pub edge: Edge,
}

/// Lifecycle state. Terminal states are `TriggerEntry`, `Expired` and `Invalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ZoneState {
    Forming,
    Qualified,
    BreakoutDetected {
        side: Side,
        breakout_bar: i64,
    },
    RetestWait {
        side: Side,
        breakout_bar: i64,
        bars_waited: usize,
        pulled_back: bool,
    },
    TriggerEntry {
        side: Side,
    },
    Expired,
    Invalidated,
}

impl ZoneState {
    /// Position in the lifecycle order. Never decreases for a given zone.
    pub fn rank(&self) -> u8 {
        match self {
            ZoneState::Forming => 0,
            ZoneState::Qualified => 1,
            ZoneState::BreakoutDetected { .. } => 2,
            ZoneState::RetestWait { .. } => 3,
            ZoneState::TriggerEntry { .. } | ZoneState::Expired | ZoneState::Invalidated => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    pub fn name(&self) -> &'static str {
        match self {
            ZoneState::Forming => "FORMING",
            ZoneState::Qualified => "QUALIFIED",
            ZoneState::BreakoutDetected { .. } => "BREAKOUT_DETECTED",
            ZoneState::RetestWait { .. } => "RETEST_WAIT",
            ZoneState::TriggerEntry { .. } => "TRIGGER_ENTRY",
            ZoneState::Expired => "EXPIRED",
            ZoneState::Invalidated => "INVALIDATED",
        }
    }
}

impl std::fmt::Display for ZoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A consolidation band owned by one symbol's tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub symbol: String,
    pub top: f64,
    pub bottom: f64,
    pub first_bar: i64,
    pub last_touch_bar: i64,
    pub touches: Vec<Touch>,
    pub dwell_bars: usize,
    pub atr_at_detection: f64,
    pub state: ZoneState,
    /// Bar at which the zone first met every qualification rule.
    pub qualified_at: Option<i64>,
    /// Bar of the breakout candle, if any.
    pub broke_out_at: Option<i64>,
    /// Bar at which the zone reached a terminal state.
    pub retired_at: Option<i64>,
}

impl Zone {
    pub fn width(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn touches_on(&self, edge: Edge) -> usize {
        self.touches.iter().filter(|t| t.edge == edge).count()
    }

    /// Touch count on the stronger edge.
    pub fn max_touches(&self) -> usize {
        self.touches_on(Edge::Top).max(self.touches_on(Edge::Bottom))
    }

    pub fn touch_buffer(&self, params: &ZoneParams) -> f64 {
        params.touch_buffer_frac * self.atr_at_detection
    }

    pub fn breakout_buffer(&self, params: &ZoneParams) -> f64 {
        params.breakout_buffer_frac * self.atr_at_detection
    }

    /// Every pair of same-edge touches is at least `separation` bars apart.
    pub fn touches_separated(&self, edge: Edge, separation: usize) -> bool {
        let bars: Vec<i64> = self
            .touches
            .iter()
            .filter(|t| t.edge == edge)
            .map(|t| t.bar_index)
            .collect();
        bars.windows(2).all(|w| w[1] - w[0] >= separation as i64)
    }

    /// An edge with enough separated touches to break out from.
    pub fn edge_ready(&self, edge: Edge, params: &ZoneParams) -> bool {
        self.touches_on(edge) >= MIN_EDGE_TOUCHES
            && self.touches_separated(edge, params.touch_separation_bars)
    }

    /// All qualification rules hold for this zone as it stands.
    pub fn qualifies(&self, params: &ZoneParams) -> bool {
        let edge_ok = self.edge_ready(Edge::Top, params) || self.edge_ready(Edge::Bottom, params);
        edge_ok
            && self.dwell_bars >= params.dwell_bars
            && self.atr_at_detection > 0.0
            && self.width() <= params.atr_tight_mult * self.atr_at_detection
    }

    /// Record a touch if it respects the separation rule for its edge.
    pub fn register_touch(&mut self, touch: Touch, separation: usize) -> bool {
        let last = self
            .touches
            .iter()
            .rev()
            .find(|t| t.edge == touch.edge)
            .map(|t| t.bar_index);
        if let Some(prev) = last {
            if touch.bar_index - prev < separation as i64 {
                return false;
            }
        }
        self.last_touch_bar = self.last_touch_bar.max(touch.bar_index);
        self.touches.push(touch);
        true
    }

    /// The zone got past FORMING at some point.
    pub fn progressed(&self) -> bool {
        self.qualified_at.is_some() || self.broke_out_at.is_some()
    }
}
