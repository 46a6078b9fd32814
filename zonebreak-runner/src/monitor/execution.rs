//! Bridge between risk decisions and the execution gateway.
//!
//! Entries reserve a book slot first, then place the order, and release the
//! slot if the order never filled. A filled entry gets a reduce-only stop
//! order on the exchange, replaced whenever the trailing stop moves. Exits
//! flatten on the exchange first and only then leave the book; a failed
//! flatten is retried on the next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use zonebreak_core::domain::{ExitReason, Position};
use zonebreak_core::gateway::binance::conform_qty;
use zonebreak_core::gateway::{ExecutionGateway, GatewayError, OrderRequest};
use zonebreak_core::risk::{ClosedPosition, ExitSignal, Rejection, RiskManager};
use zonebreak_core::sync::lock;
use zonebreak_core::zones::EntrySignal;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("entry rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Stop order currently resting on the exchange for one position.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingStop {
    pub order_id: String,
    pub price: f64,
}

pub struct ExecutionBridge {
    gateway: Arc<dyn ExecutionGateway>,
    leverage: u32,
    /// Symbols already switched to isolated margin at our leverage.
    configured: Mutex<BTreeSet<String>>,
    failed_exits: Mutex<BTreeMap<String, ExitSignal>>,
    stops: Mutex<BTreeMap<String, RestingStop>>,
}

impl ExecutionBridge {
    pub fn new(gateway: Arc<dyn ExecutionGateway>, leverage: u32) -> Self {
        Self {
            gateway,
            leverage,
            configured: Mutex::new(BTreeSet::new()),
            failed_exits: Mutex::new(BTreeMap::new()),
            stops: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn gateway(&self) -> &dyn ExecutionGateway {
        self.gateway.as_ref()
    }

    /// Close every exchange position the book does not own. Returns the
    /// symbols that were flattened.
    pub fn clear_orphans(&self, risk: &RiskManager) -> Result<Vec<String>, GatewayError> {
        let mut cleared = Vec::new();
        for held in self.gateway.get_open_positions()? {
            if risk.book().contains(&held.symbol) {
                continue;
            }
            warn!(symbol = %held.symbol, qty = held.qty, "closing orphan exchange position");
            self.gateway.close_position(&held.symbol)?;
            cleared.push(held.symbol);
        }
        Ok(cleared)
    }

    /// Isolated margin and leverage, once per symbol per process.
    pub fn prepare_symbol(&self, symbol: &str) -> Result<(), GatewayError> {
        if lock(&self.configured).contains(symbol) {
            return Ok(());
        }
        self.gateway.set_isolated_margin(symbol)?;
        self.gateway.set_leverage(symbol, self.leverage)?;
        lock(&self.configured).insert(symbol.to_string());
        Ok(())
    }

    /// Size, reserve and place the entry for `signal`.
    pub fn enter(&self, risk: &RiskManager, signal: &EntrySignal, trend_aligned: bool) -> Result<Position, EntryError> {
        let balance = self.gateway.available_balance()?;
        let mut planned = risk.plan(signal, signal.entry_price, balance, trend_aligned)?;
        planned.size = conform_qty(self.gateway.as_ref(), &signal.symbol, planned.size)?;
        if planned.size <= 0.0 {
            return Err(Rejection::ZeroSize.into());
        }

        let reserved = risk.open(planned)?;
        let placed = self
            .prepare_symbol(&signal.symbol)
            .and_then(|()| {
                self.gateway
                    .place_order(&OrderRequest::market(&signal.symbol, signal.side, reserved.size))
            });

        match placed {
            Ok(ack) => {
                let fill = ack.avg_price.filter(|p| *p > 0.0);
                if let Some(price) = fill {
                    risk.book().with_position(&signal.symbol, |p| {
                        p.entry_price = price;
                        p.best_price = price;
                        p.worst_price = price;
                    });
                }
                info!(symbol = %signal.symbol, order_id = %ack.order_id, fill = ?fill, "entry order filled");
                self.sync_stop(risk, &signal.symbol);
                Ok(risk.book().get(&signal.symbol).unwrap_or(reserved))
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "entry order failed");
                risk.abandon(&signal.symbol);
                Err(e.into())
            }
        }
    }

    pub fn resting_stop(&self, symbol: &str) -> Option<RestingStop> {
        lock(&self.stops).get(symbol).cloned()
    }

    /// Move the exchange stop for `symbol` to the book's trailing stop.
    ///
    /// The replacement is placed before the old order is cancelled, so the
    /// position is never left unprotected. A failed placement keeps the old
    /// order and is retried on the next call.
    pub fn sync_stop(&self, risk: &RiskManager, symbol: &str) {
        let Some(position) = risk.book().get(symbol) else {
            return;
        };
        let target = position.trailing_stop_price;
        let previous = self.resting_stop(symbol);
        if previous.as_ref().is_some_and(|s| s.price == target) {
            return;
        }
        let req = OrderRequest::stop_loss(symbol, position.side, position.size, target);
        match self.gateway.place_order(&req) {
            Ok(ack) => {
                debug!(symbol, order_id = %ack.order_id, stop = target, "stop order placed");
                lock(&self.stops).insert(
                    symbol.to_string(),
                    RestingStop {
                        order_id: ack.order_id,
                        price: target,
                    },
                );
                if let Some(old) = previous {
                    if let Err(e) = self.gateway.cancel_order(symbol, &old.order_id) {
                        warn!(symbol, order_id = %old.order_id, error = %e, "failed to cancel replaced stop order");
                    }
                }
            }
            Err(e) => warn!(symbol, stop = target, error = %e, "stop order failed"),
        }
    }

    /// Cancel the resting stop for `symbol` once the position is gone.
    fn cancel_stop(&self, symbol: &str) {
        let Some(stop) = lock(&self.stops).remove(symbol) else {
            return;
        };
        if let Err(e) = self.gateway.cancel_order(symbol, &stop.order_id) {
            warn!(symbol, order_id = %stop.order_id, error = %e, "failed to cancel stop order");
        }
    }

    /// Flatten for a stop exit, then close in the book.
    ///
    /// A rejected flatten on a symbol the exchange already reports flat means
    /// the resting stop fired first; the book closes at that stop's price.
    pub fn exit(&self, risk: &RiskManager, exit: &ExitSignal) -> Option<ClosedPosition> {
        let position = risk.book().get(&exit.symbol)?;
        let req = OrderRequest::flatten(&exit.symbol, position.side, position.size);
        match self.gateway.place_order(&req) {
            Ok(ack) => {
                lock(&self.failed_exits).remove(&exit.symbol);
                self.cancel_stop(&exit.symbol);
                let price = ack.avg_price.filter(|p| *p > 0.0).unwrap_or(exit.price);
                risk.close(&exit.symbol, price, exit.at, exit.reason)
            }
            Err(e @ GatewayError::Rejected { .. }) if self.exchange_flat(&exit.symbol) => {
                let stop = lock(&self.stops).remove(&exit.symbol);
                info!(symbol = %exit.symbol, error = %e, "position already closed by the exchange stop");
                lock(&self.failed_exits).remove(&exit.symbol);
                let price = stop.map_or(exit.price, |s| s.price);
                risk.close(&exit.symbol, price, exit.at, exit.reason)
            }
            Err(e) => {
                warn!(symbol = %exit.symbol, error = %e, "exit order failed, retrying next cycle");
                lock(&self.failed_exits).insert(exit.symbol.clone(), exit.clone());
                None
            }
        }
    }

    fn exchange_flat(&self, symbol: &str) -> bool {
        match self.gateway.get_open_positions() {
            Ok(open) => !open.iter().any(|p| p.symbol == symbol),
            Err(_) => false,
        }
    }

    /// Retry exits whose flatten order failed earlier.
    pub fn retry_failed_exits(&self, risk: &RiskManager) -> Vec<ClosedPosition> {
        let pending: Vec<ExitSignal> = lock(&self.failed_exits).values().cloned().collect();
        pending.iter().filter_map(|exit| self.exit(risk, exit)).collect()
    }

    pub fn pending_exits(&self) -> usize {
        lock(&self.failed_exits).len()
    }

    /// Flatten `symbol` on request. `mark` prices the book close when the
    /// venue reports no fill price.
    pub fn close_external(
        &self,
        risk: &RiskManager,
        symbol: &str,
        mark: f64,
    ) -> Result<Option<ClosedPosition>, GatewayError> {
        if !risk.book().contains(symbol) {
            return Ok(None);
        }
        let ack = self.gateway.close_position(symbol)?;
        let price = ack.and_then(|a| a.avg_price).filter(|p| *p > 0.0).unwrap_or(mark);
        lock(&self.failed_exits).remove(symbol);
        self.cancel_stop(symbol);
        Ok(risk.close(symbol, price, Utc::now(), ExitReason::External))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use zonebreak_core::domain::{Side, ZoneId};
    use zonebreak_core::gateway::{ExchangePosition, GatewayCall, OrderKind, PaperGateway};
    use zonebreak_core::risk::RiskParams;

    fn signal(symbol: &str, entry: f64, stop: f64) -> EntrySignal {
        EntrySignal {
            symbol: symbol.to_string(),
            zone_id: ZoneId(1),
            side: Side::Long,
            entry_price: entry,
            stop_price: stop,
            bar_index: 100,
            signal_time: Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap(),
            zone_top: 100.0,
            zone_bottom: 99.0,
            breakout_level: 100.3,
            dwell_bars: 20,
            touches: 4,
        }
    }

    fn bridge(gw: &Arc<PaperGateway>) -> ExecutionBridge {
        let gateway: Arc<dyn ExecutionGateway> = gw.clone();
        ExecutionBridge::new(gateway, 10)
    }

    #[test]
    fn entry_configures_symbol_then_orders() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        gw.set_mark("BTCUSDT", 101.0);
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());

        let pos = bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        // 5% of 1000 over a 2.0 stop distance
        assert!((pos.size - 25.0).abs() < 1e-9);
        assert!(risk.book().contains("BTCUSDT"));
        assert_eq!(gw.leverage_for("BTCUSDT"), Some(10));
        assert!(gw
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::PlaceOrder(req) if req.side == Side::Long && !req.reduce_only)));

        // second entry on another symbol only configures that one
        bridge.enter(&risk, &signal("ETHUSDT", 101.0, 99.0), false).unwrap();
        let leverage_calls = gw
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::SetLeverage { .. }))
            .count();
        assert_eq!(leverage_calls, 2);
    }

    #[test]
    fn failed_order_releases_the_slot() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.prepare_symbol("BTCUSDT").unwrap();

        // balance and step lookups succeed, the order itself fails
        gw.fail_next_after(2, GatewayError::Rejected {
            code: -2019,
            msg: "margin is insufficient".into(),
        });
        let err = bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap_err();
        assert!(matches!(err, EntryError::Gateway(GatewayError::Rejected { .. })));
        assert!(risk.book().is_empty());
    }

    #[test]
    fn full_book_rejects_before_ordering() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams {
            max_positions: 1,
            ..RiskParams::default()
        });
        bridge.enter(&risk, &signal("AAA", 101.0, 99.0), true).unwrap();
        let orders_before = gw
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::PlaceOrder(_)))
            .count();

        let err = bridge.enter(&risk, &signal("BBB", 101.0, 99.0), true).unwrap_err();
        assert!(matches!(err, EntryError::Rejected(Rejection::CapReached { max: 1 })));
        let orders_after = gw
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::PlaceOrder(_)))
            .count();
        assert_eq!(orders_before, orders_after);
    }

    #[test]
    fn failed_exit_is_retried() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();

        let exit = ExitSignal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            price: 99.0,
            reason: ExitReason::StopLoss,
            at: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
        };
        gw.fail_next(GatewayError::Timeout("slow".into()));
        assert!(bridge.exit(&risk, &exit).is_none());
        assert!(risk.book().contains("BTCUSDT"));
        assert_eq!(bridge.pending_exits(), 1);

        let closed = bridge.retry_failed_exits(&risk);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_price, 99.0);
        assert!(risk.book().is_empty());
        assert_eq!(bridge.pending_exits(), 0);
    }

    #[test]
    fn orphans_are_flattened() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        gw.seed_position(ExchangePosition {
            symbol: "DOGEUSDT".into(),
            qty: -300.0,
            entry_price: 0.1,
        });
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());

        let cleared = bridge.clear_orphans(&risk).unwrap();
        assert_eq!(cleared, vec!["DOGEUSDT"]);
        assert!(gw.get_open_positions().unwrap().is_empty());
    }

    #[test]
    fn external_close_uses_mark_without_fill_price() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();

        let closed = bridge.close_external(&risk, "BTCUSDT", 103.0).unwrap().unwrap();
        assert_eq!(closed.reason, ExitReason::External);
        assert_eq!(closed.exit_price, 103.0);
        assert!(bridge.close_external(&risk, "BTCUSDT", 103.0).unwrap().is_none());
    }

    fn stop_orders(gw: &PaperGateway) -> Vec<f64> {
        gw.calls()
            .iter()
            .filter_map(|c| match c {
                GatewayCall::PlaceOrder(req) => match req.kind {
                    OrderKind::StopMarket(stop) => Some(stop),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn filled_entry_rests_a_stop_order() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        gw.set_mark("BTCUSDT", 101.0);
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();

        let calls = gw.calls();
        let entry_at = calls
            .iter()
            .position(|c| matches!(c, GatewayCall::PlaceOrder(req) if req.kind == OrderKind::Market))
            .unwrap();
        match &calls[entry_at + 1] {
            GatewayCall::PlaceOrder(req) => {
                assert_eq!(req.kind, OrderKind::StopMarket(99.0));
                assert_eq!(req.side, Side::Short);
                assert!(req.reduce_only);
                assert!((req.qty - 25.0).abs() < 1e-9);
            }
            other => panic!("expected the stop order, got {other:?}"),
        }
        assert_eq!(gw.resting_stops("BTCUSDT"), vec![99.0]);
        assert_eq!(bridge.resting_stop("BTCUSDT").map(|s| s.price), Some(99.0));
    }

    #[test]
    fn trailing_move_replaces_the_stop() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        let first = bridge.resting_stop("BTCUSDT").unwrap();

        // unchanged stop places nothing
        let before = gw.calls().len();
        bridge.sync_stop(&risk, "BTCUSDT");
        assert_eq!(gw.calls().len(), before);

        risk.book().with_position("BTCUSDT", |p| p.trailing_stop_price = 100.2);
        bridge.sync_stop(&risk, "BTCUSDT");
        let calls = gw.calls();
        assert_eq!(calls.len(), before + 2);
        assert!(matches!(&calls[before], GatewayCall::PlaceOrder(req) if req.kind == OrderKind::StopMarket(100.2)));
        assert_eq!(
            calls[before + 1],
            GatewayCall::CancelOrder {
                symbol: "BTCUSDT".into(),
                order_id: first.order_id,
            }
        );
        assert_eq!(gw.resting_stops("BTCUSDT"), vec![100.2]);
        assert_eq!(stop_orders(&gw), vec![99.0, 100.2]);
    }

    #[test]
    fn failed_stop_placement_keeps_position_and_retries() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        // balance, step, margin, leverage and the entry succeed; the stop fails
        gw.fail_next_after(5, GatewayError::Timeout("slow".into()));
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        assert!(risk.book().contains("BTCUSDT"));
        assert_eq!(bridge.resting_stop("BTCUSDT"), None);
        assert!(gw.resting_stops("BTCUSDT").is_empty());

        bridge.sync_stop(&risk, "BTCUSDT");
        assert_eq!(gw.resting_stops("BTCUSDT"), vec![99.0]);
    }

    #[test]
    fn exit_cancels_the_resting_stop() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        let exit = ExitSignal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            price: 99.0,
            reason: ExitReason::StopLoss,
            at: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
        };
        assert!(bridge.exit(&risk, &exit).is_some());
        assert!(gw.resting_stops("BTCUSDT").is_empty());
        assert_eq!(bridge.resting_stop("BTCUSDT"), None);
        assert!(matches!(gw.calls().last(), Some(GatewayCall::CancelOrder { .. })));
    }

    #[test]
    fn exchange_stop_fill_closes_the_book_at_the_stop() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        risk.book().with_position("BTCUSDT", |p| p.trailing_stop_price = 99.6);
        bridge.sync_stop(&risk, "BTCUSDT");
        // the venue flattens on its own; our reduce-only flatten is then rejected
        gw.close_position("BTCUSDT").unwrap();

        let exit = ExitSignal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            price: 99.4,
            reason: ExitReason::TrailingStop,
            at: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
        };
        let closed = bridge.exit(&risk, &exit).unwrap();
        assert_eq!(closed.exit_price, 99.6);
        assert!(risk.book().is_empty());
        assert_eq!(bridge.pending_exits(), 0);
        assert_eq!(bridge.resting_stop("BTCUSDT"), None);
    }

    #[test]
    fn external_close_cancels_the_stop() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let bridge = bridge(&gw);
        let risk = RiskManager::new(RiskParams::default());
        bridge.enter(&risk, &signal("BTCUSDT", 101.0, 99.0), true).unwrap();
        bridge.close_external(&risk, "BTCUSDT", 103.0).unwrap();
        assert!(gw.resting_stops("BTCUSDT").is_empty());
    }
}
