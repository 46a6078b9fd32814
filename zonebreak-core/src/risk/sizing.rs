//! Position sizing from a fixed-risk budget.

use super::Rejection;

/// Units to trade so that hitting `stop` loses `balance * pct / 100`.
///
/// The result is capped so notional never exceeds `balance * leverage`.
pub fn position_size(
    balance: f64,
    pct: f64,
    entry: f64,
    stop: f64,
    leverage: f64,
) -> Result<f64, Rejection> {
    if !(balance.is_finite() && balance > 0.0) {
        return Err(Rejection::NoBalance(balance));
    }
    let risk_per_unit = (entry - stop).abs();
    if !(entry.is_finite() && stop.is_finite()) || entry <= 0.0 || risk_per_unit <= 0.0 {
        return Err(Rejection::InvalidRisk { entry, stop });
    }
    let budget = balance * pct / 100.0;
    let uncapped = budget / risk_per_unit;
    let cap = balance * leverage / entry;
    let size = uncapped.min(cap);
    if !(size.is_finite() && size > 0.0) {
        return Err(Rejection::ZeroSize);
    }
    Ok(size)
}

/// Round `qty` down to a multiple of `step`. A non-positive step leaves it alone.
pub fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 || !step.is_finite() {
        return qty;
    }
    // Nudge before flooring so 0.3 / 0.1 doesn't land on 2.999...
    ((qty / step) + 1e-9).floor() * step
}
