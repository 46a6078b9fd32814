//! Domain types shared by the live monitor and the backtest simulator.

pub mod candle;
pub mod ids;
pub mod position;
pub mod trade;

pub use candle::{validate_series, Candle, CandleError, Timeframe};
pub use ids::{ZoneId, ZoneIdGen};
pub use position::{ExitReason, Position, Side};
pub use trade::BacktestTrade;

/// Symbol type alias
pub type Symbol = String;
