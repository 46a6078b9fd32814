//! Execution gateway: the seam between decisions and the exchange.
//!
//! [`ExecutionGateway`] is implemented by the signed Binance client, the
//! in-memory paper gateway used for dry runs, and [`RetryingGateway`], which
//! wraps either with bounded exponential backoff.

pub mod binance;
pub mod paper;
pub mod retry;

pub use binance::BinanceFuturesGateway;
pub use paper::{GatewayCall, PaperGateway};
pub use retry::{RetryPolicy, RetryingGateway};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Side;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit(f64),
    /// Market order armed at the stop price (mark-price trigger).
    StopMarket(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub kind: OrderKind,
    /// Only reduce an existing position (exits).
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            kind: OrderKind::Market,
            reduce_only: false,
        }
    }

    /// Market order flattening a position held on `held` side.
    pub fn flatten(symbol: &str, held: Side, qty: f64) -> Self {
        Self {
            reduce_only: true,
            ..Self::market(symbol, held.opposite(), qty)
        }
    }

    /// Resting stop-loss protecting a position held on `held` side.
    pub fn stop_loss(symbol: &str, held: Side, qty: f64, stop: f64) -> Self {
        Self {
            kind: OrderKind::StopMarket(stop),
            ..Self::flatten(symbol, held, qty)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub executed_qty: f64,
    /// Average fill price when the venue reports one.
    pub avg_price: Option<f64>,
}

/// A position as the exchange reports it. `qty` is signed: negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
}

impl ExchangePosition {
    pub fn side(&self) -> Side {
        if self.qty < 0.0 {
            Side::Short
        } else {
            Side::Long
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Rate limits, timeouts and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Timeout(_) | GatewayError::Transport(_)
        )
    }
}

pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &str;

    fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError>;

    /// Cancel a resting order.
    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;

    fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;

    /// Switch `symbol` to isolated margin. Already-isolated is success.
    fn set_isolated_margin(&self, _symbol: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Non-flat positions only.
    fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    /// Flatten `symbol` at market. `None` when there was nothing to close.
    fn close_position(&self, symbol: &str) -> Result<Option<OrderAck>, GatewayError>;

    fn available_balance(&self) -> Result<f64, GatewayError>;

    /// Quantity increment for `symbol`, when the venue enforces one.
    fn quantity_step(&self, _symbol: &str) -> Result<Option<f64>, GatewayError> {
        Ok(None)
    }
}

impl<G: ExecutionGateway + ?Sized> ExecutionGateway for Arc<G> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        (**self).place_order(req)
    }
    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        (**self).cancel_order(symbol, order_id)
    }
    fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        (**self).set_leverage(symbol, leverage)
    }
    fn set_isolated_margin(&self, symbol: &str) -> Result<(), GatewayError> {
        (**self).set_isolated_margin(symbol)
    }
    fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        (**self).get_open_positions()
    }
    fn close_position(&self, symbol: &str) -> Result<Option<OrderAck>, GatewayError> {
        (**self).close_position(symbol)
    }
    fn available_balance(&self) -> Result<f64, GatewayError> {
        (**self).available_balance()
    }
    fn quantity_step(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        (**self).quantity_step(symbol)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => f.write_str("MARKET"),
            OrderKind::Limit(_) => f.write_str("LIMIT"),
            OrderKind::StopMarket(_) => f.write_str("STOP_MARKET"),
        }
    }
}
