//! In-memory gateway for dry runs and tests.
//!
//! Records every call, fills market orders at the last mark it was given,
//! rests stop orders until they are cancelled, and can be scripted to fail
//! the next N calls.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use tracing::info;

use super::{ExchangePosition, ExecutionGateway, GatewayError, OrderAck, OrderKind, OrderRequest};
use crate::domain::Side;
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    PlaceOrder(OrderRequest),
    CancelOrder { symbol: String, order_id: String },
    SetLeverage { symbol: String, leverage: u32 },
    SetIsolatedMargin(String),
    GetOpenPositions,
    ClosePosition(String),
    AvailableBalance,
    QuantityStep(String),
}

#[derive(Debug, Default)]
struct PaperState {
    calls: Vec<GatewayCall>,
    /// `None` lets one call through before the next scripted failure.
    failures: VecDeque<Option<GatewayError>>,
    positions: BTreeMap<String, ExchangePosition>,
    marks: BTreeMap<String, f64>,
    leverage: BTreeMap<String, u32>,
    /// Resting stop orders by order id.
    stops: BTreeMap<String, OrderRequest>,
    next_order_id: u64,
}

#[derive(Debug)]
pub struct PaperGateway {
    balance: f64,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Fail the next call with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: GatewayError) {
        lock(&self.state).failures.push_back(Some(err));
    }

    /// Let `calls` calls succeed, then fail the one after with `err`.
    pub fn fail_next_after(&self, calls: usize, err: GatewayError) {
        let mut state = lock(&self.state);
        state.failures.extend(std::iter::repeat_with(|| None).take(calls));
        state.failures.push_back(Some(err));
    }

    /// Price used for market fills on `symbol`.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        lock(&self.state).marks.insert(symbol.to_string(), price);
    }

    /// Seed a position that exists only on the "exchange".
    pub fn seed_position(&self, position: ExchangePosition) {
        lock(&self.state).positions.insert(position.symbol.clone(), position);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.state).calls.clone()
    }

    pub fn leverage_for(&self, symbol: &str) -> Option<u32> {
        lock(&self.state).leverage.get(symbol).copied()
    }

    /// Trigger prices of the stop orders resting on `symbol`.
    pub fn resting_stops(&self, symbol: &str) -> Vec<f64> {
        lock(&self.state)
            .stops
            .values()
            .filter(|o| o.symbol == symbol)
            .filter_map(|o| match o.kind {
                OrderKind::StopMarket(stop) => Some(stop),
                _ => None,
            })
            .collect()
    }

    /// Record `call` and pop a scripted failure if one is queued.
    fn enter(&self, call: GatewayCall) -> Result<std::sync::MutexGuard<'_, PaperState>, GatewayError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        let failure = state.failures.pop_front().flatten();
        match failure {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn rest(state: &mut PaperState, req: &OrderRequest) -> OrderAck {
        state.next_order_id += 1;
        let order_id = format!("paper-{}", state.next_order_id);
        state.stops.insert(order_id.clone(), req.clone());
        OrderAck {
            order_id,
            symbol: req.symbol.clone(),
            executed_qty: 0.0,
            avg_price: None,
        }
    }

    fn fill(state: &mut PaperState, req: &OrderRequest) -> OrderAck {
        state.next_order_id += 1;
        let price = match req.kind {
            OrderKind::Limit(p) => Some(p),
            OrderKind::Market | OrderKind::StopMarket(_) => state.marks.get(&req.symbol).copied(),
        };
        let signed = req.side.sign() * req.qty;
        let entry = state.positions.remove(&req.symbol);
        let (qty, entry_price) = match entry {
            Some(p) => (p.qty + signed, p.entry_price),
            None => (signed, price.unwrap_or(0.0)),
        };
        if qty.abs() > f64::EPSILON {
            state.positions.insert(
                req.symbol.clone(),
                ExchangePosition {
                    symbol: req.symbol.clone(),
                    qty,
                    entry_price,
                },
            );
        }
        OrderAck {
            order_id: format!("paper-{}", state.next_order_id),
            symbol: req.symbol.clone(),
            executed_qty: req.qty,
            avg_price: price,
        }
    }
}

impl ExecutionGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut state = self.enter(GatewayCall::PlaceOrder(req.clone()))?;
        info!(symbol = %req.symbol, side = %req.side, qty = req.qty, kind = %req.kind, "DRY-RUN order");
        if let OrderKind::StopMarket(_) = req.kind {
            return Ok(Self::rest(&mut state, req));
        }
        let reduces = state
            .positions
            .get(&req.symbol)
            .is_some_and(|p| p.side() != req.side);
        if req.reduce_only && !reduces {
            return Err(GatewayError::Rejected {
                code: -2022,
                msg: "ReduceOnly Order is rejected.".into(),
            });
        }
        Ok(Self::fill(&mut state, req))
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let mut state = self.enter(GatewayCall::CancelOrder {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        })?;
        match state.stops.get(order_id) {
            Some(o) if o.symbol == symbol => {
                state.stops.remove(order_id);
                info!(symbol, order_id, "DRY-RUN cancel");
                Ok(())
            }
            _ => Err(GatewayError::Rejected {
                code: -2011,
                msg: "Unknown order sent.".into(),
            }),
        }
    }

    fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let mut state = self.enter(GatewayCall::SetLeverage {
            symbol: symbol.to_string(),
            leverage,
        })?;
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    fn set_isolated_margin(&self, symbol: &str) -> Result<(), GatewayError> {
        self.enter(GatewayCall::SetIsolatedMargin(symbol.to_string()))?;
        Ok(())
    }

    fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        let state = self.enter(GatewayCall::GetOpenPositions)?;
        Ok(state.positions.values().cloned().collect())
    }

    fn close_position(&self, symbol: &str) -> Result<Option<OrderAck>, GatewayError> {
        let mut state = self.enter(GatewayCall::ClosePosition(symbol.to_string()))?;
        let Some(held) = state.positions.get(symbol).cloned() else {
            return Ok(None);
        };
        let req = OrderRequest::flatten(symbol, held.side(), held.qty.abs());
        info!(symbol, qty = held.qty, "DRY-RUN close");
        Ok(Some(Self::fill(&mut state, &req)))
    }

    fn available_balance(&self) -> Result<f64, GatewayError> {
        self.enter(GatewayCall::AvailableBalance)?;
        Ok(self.balance)
    }

    fn quantity_step(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        self.enter(GatewayCall::QuantityStep(symbol.to_string()))?;
        Ok(None)
    }
}
