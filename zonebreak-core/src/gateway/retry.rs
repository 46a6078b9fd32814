//! Bounded exponential backoff around any gateway.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ExchangePosition, ExecutionGateway, GatewayError, OrderAck, OrderRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `n` (1-based): `base * 2^(n-1)`, capped at `max_delay`.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: ExecutionGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn call<T>(&self, op: &str, f: impl Fn(&G) -> Result<T, GatewayError>) -> Result<T, GatewayError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let mut delay = self.policy.delay_for(attempt);
                    if let GatewayError::RateLimited { retry_after_ms } = &e {
                        delay = delay.max(Duration::from_millis(*retry_after_ms)).min(self.policy.max_delay);
                    }
                    warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "gateway call failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<G: ExecutionGateway> ExecutionGateway for RetryingGateway<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.call("place_order", |g| g.place_order(req))
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.call("cancel_order", |g| g.cancel_order(symbol, order_id))
    }

    fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.call("set_leverage", |g| g.set_leverage(symbol, leverage))
    }

    fn set_isolated_margin(&self, symbol: &str) -> Result<(), GatewayError> {
        self.call("set_isolated_margin", |g| g.set_isolated_margin(symbol))
    }

    fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        self.call("get_open_positions", |g| g.get_open_positions())
    }

    fn close_position(&self, symbol: &str) -> Result<Option<OrderAck>, GatewayError> {
        self.call("close_position", |g| g.close_position(symbol))
    }

    fn available_balance(&self) -> Result<f64, GatewayError> {
        self.call("available_balance", |g| g.available_balance())
    }

    fn quantity_step(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        self.call("quantity_step", |g| g.quantity_step(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::gateway::PaperGateway;

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
        assert_eq!(p.delay_for(6), Duration::from_secs(30));
        assert_eq!(p.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn transient_failures_are_retried() {
        let paper = PaperGateway::new(1_000.0);
        paper.fail_next(GatewayError::Timeout("slow".into()));
        paper.fail_next(GatewayError::Transport("reset".into()));
        let gw = RetryingGateway::new(paper, instant());
        let ack = gw.place_order(&OrderRequest::market("BTCUSDT", Side::Long, 1.0)).unwrap();
        assert_eq!(ack.executed_qty, 1.0);
        assert_eq!(gw.inner().calls().len(), 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let paper = PaperGateway::new(1_000.0);
        for _ in 0..5 {
            paper.fail_next(GatewayError::RateLimited { retry_after_ms: 0 });
        }
        let gw = RetryingGateway::new(paper, instant());
        let err = gw.available_balance().unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(gw.inner().calls().len(), 3);
    }

    #[test]
    fn rejections_are_not_retried() {
        let paper = PaperGateway::new(1_000.0);
        paper.fail_next(GatewayError::Rejected {
            code: -2019,
            msg: "Margin is insufficient.".into(),
        });
        let gw = RetryingGateway::new(paper, instant());
        assert!(gw.set_leverage("BTCUSDT", 10).is_err());
        assert_eq!(gw.inner().calls().len(), 1);
    }
}
