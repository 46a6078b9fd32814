//! BacktestTrade: an append-only ledger entry for a closed round trip.

use super::position::{ExitReason, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A complete round-trip trade: entry → exit, with costs and excursions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    // ── Identification ──
    pub symbol: String,
    pub side: Side,

    // ── Entry ──
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,

    // ── Exit ──
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,

    // ── Size ──
    pub size: f64,

    // ── Costs / PnL ──
    /// Taker fees on both legs.
    pub fees: f64,
    /// Cost of adverse fill adjustment on both legs.
    pub slippage: f64,
    pub net_pnl: f64,

    // ── Excursion (R multiples) ──
    pub mfe_r: f64,
    pub mae_r: f64,
    pub r_multiple: f64,

    pub exit_reason: ExitReason,
    pub trend_aligned: bool,
    pub bars_held: i64,
}

impl BacktestTrade {
    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn holding_minutes(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 60.0
    }
}
