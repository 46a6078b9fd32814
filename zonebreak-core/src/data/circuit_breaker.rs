//! Exchange circuit breaker keyed on HTTP status.
//!
//! | status        | verdict   | effect                                   |
//! |---------------|-----------|------------------------------------------|
//! | 2xx           | `Proceed` | throttle count reset                     |
//! | 403, 418      | `Refuse`  | trips at once (WAF block / IP ban)       |
//! | 429, 5xx      | `Retry`   | counted; the `threshold`-th one trips    |
//! | other 4xx     | `Proceed` | no change, the caller reads the body     |
//!
//! While tripped every request is refused until the cooldown has elapsed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::sync::lock;

/// What the caller should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Retry,
    Refuse,
}

#[derive(Debug, Default)]
struct Health {
    throttled: u32,
    tripped_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    health: Mutex<Health>,
    cooldown: Duration,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, threshold: u32) -> Self {
        Self {
            health: Mutex::new(Health::default()),
            cooldown,
            threshold: threshold.max(1),
        }
    }

    /// Five minute cooldown after the third throttled response in a row.
    pub fn default_exchange() -> Self {
        Self::new(Duration::from_secs(5 * 60), 3)
    }

    /// False while tripped. The first call after the cooldown closes it again.
    pub fn is_allowed(&self) -> bool {
        let mut health = lock(&self.health);
        match health.tripped_at {
            None => true,
            Some(at) if at.elapsed() >= self.cooldown => {
                info!("circuit breaker closed after cooldown");
                *health = Health::default();
                true
            }
            Some(_) => false,
        }
    }

    /// Account for one response with HTTP `status`.
    pub fn record_status(&self, status: u16) -> Verdict {
        let mut health = lock(&self.health);
        match status {
            200..=299 => {
                health.throttled = 0;
                Verdict::Proceed
            }
            403 | 418 => {
                warn!(status, cooldown_secs = self.cooldown.as_secs(), "exchange ban, circuit breaker tripped");
                health.tripped_at = Some(Instant::now());
                Verdict::Refuse
            }
            429 | 500..=599 => {
                health.throttled += 1;
                if health.throttled >= self.threshold {
                    warn!(status, throttled = health.throttled, "circuit breaker tripped");
                    health.tripped_at = Some(Instant::now());
                    Verdict::Refuse
                } else {
                    Verdict::Retry
                }
            }
            _ => Verdict::Proceed,
        }
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match lock(&self.health).tripped_at {
            None => Duration::ZERO,
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
        }
    }
}
