//! zonebreak core: domain types and decision logic for a zone-breakout futures bot.
//!
//! - Domain types (candles, positions, trades, zone ids)
//! - Indicators (EMA, Wilder ATR, swing pivots) and the multi-timeframe trend ladder
//! - Consolidation zone detection and the breakout/retest state machine
//! - Priority ranking of qualified zones
//! - Risk: sizing, the transactional position book, ratchet trailing stops
//! - Exchange seams: market data feed and execution gateway, with Binance implementations
//! - Layered settings
//!
//! Nothing here spawns threads. The runner crate schedules this logic live and
//! in backtests.

pub mod config;
pub mod data;
pub mod domain;
pub mod gateway;
pub mod indicators;
pub mod ranker;
pub mod risk;
pub mod sync;
pub mod trend;
pub mod zones;
