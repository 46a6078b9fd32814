//! Performance metrics as pure functions over the trade ledger and equity marks.
//!
//! Crypto futures trade every day, so annualization uses a 365-day year.

use serde::{Deserialize, Serialize};
use zonebreak_core::domain::BacktestTrade;

const DAYS_PER_YEAR: f64 = 365.0;
pub const PROFIT_FACTOR_CAP: f64 = 100.0;

/// Summary statistics for one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub trade_count: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub avg_r: f64,
    pub expectancy_r: f64,
    pub sharpe: f64,
    pub avg_holding_minutes: f64,
    pub final_equity: f64,
}

impl PerformanceMetrics {
    /// `equity` is the closed-trade curve starting at the initial balance,
    /// `daily` the end-of-day equity marks, `span_days` the data span.
    pub fn compute(trades: &[BacktestTrade], equity: &[f64], daily: &[f64], span_days: f64) -> Self {
        Self {
            trade_count: trades.len(),
            win_rate: win_rate(trades),
            profit_factor: profit_factor(trades),
            total_return: total_return(equity),
            cagr: cagr(equity, span_days),
            max_drawdown: max_drawdown(equity),
            avg_r: avg_r(trades),
            expectancy_r: expectancy_r(trades),
            sharpe: sharpe_ratio(daily),
            avg_holding_minutes: avg_holding_minutes(trades),
            final_equity: equity.last().copied().unwrap_or(0.0),
        }
    }
}

// ─── Individual metric functions ────────────────────────────────────

pub fn total_return(equity: &[f64]) -> f64 {
    match (equity.first(), equity.last()) {
        (Some(&first), Some(&last)) if equity.len() >= 2 && first > 0.0 => (last - first) / first,
        _ => 0.0,
    }
}

/// Compound annual growth over `span_days` calendar days.
///
/// Returns 0.0 for an empty span or a wiped-out account.
pub fn cagr(equity: &[f64], span_days: f64) -> f64 {
    let (Some(&first), Some(&last)) = (equity.first(), equity.last()) else {
        return 0.0;
    };
    if equity.len() < 2 || span_days <= 0.0 || first <= 0.0 || last <= 0.0 {
        return 0.0;
    }
    (last / first).powf(DAYS_PER_YEAR / span_days) - 1.0
}

/// Annualized Sharpe of daily equity returns, zero risk-free rate.
pub fn sharpe_ratio(daily_equity: &[f64]) -> f64 {
    let returns = daily_returns(daily_equity);
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(&returns) / std * DAYS_PER_YEAR.sqrt()
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for &eq in equity {
        peak = peak.max(eq);
        if peak > 0.0 {
            max_dd = max_dd.min((eq - peak) / peak);
        }
    }
    max_dd
}

pub fn win_rate(trades: &[BacktestTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.is_winner()).count() as f64 / trades.len() as f64
}

/// Gross profit / gross loss, capped at [`PROFIT_FACTOR_CAP`].
pub fn profit_factor(trades: &[BacktestTrade]) -> f64 {
    let gross_profit: f64 = trades.iter().filter(|t| t.net_pnl > 0.0).map(|t| t.net_pnl).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.net_pnl < 0.0)
        .map(|t| t.net_pnl.abs())
        .sum();
    if gross_loss < 1e-10 {
        return if gross_profit > 0.0 { PROFIT_FACTOR_CAP } else { 0.0 };
    }
    (gross_profit / gross_loss).min(PROFIT_FACTOR_CAP)
}

pub fn avg_r(trades: &[BacktestTrade]) -> f64 {
    let rs: Vec<f64> = trades.iter().map(|t| t.r_multiple).collect();
    mean_f64(&rs)
}

/// `win_rate × avg_win_R − loss_rate × avg_loss_R`, losses as magnitudes.
pub fn expectancy_r(trades: &[BacktestTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let wins: Vec<f64> = trades.iter().filter(|t| t.is_winner()).map(|t| t.r_multiple).collect();
    let losses: Vec<f64> = trades
        .iter()
        .filter(|t| !t.is_winner())
        .map(|t| t.r_multiple.abs())
        .collect();
    let n = trades.len() as f64;
    let win_rate = wins.len() as f64 / n;
    let loss_rate = losses.len() as f64 / n;
    win_rate * mean_f64(&wins) - loss_rate * mean_f64(&losses)
}

pub fn avg_holding_minutes(trades: &[BacktestTrade]) -> f64 {
    let mins: Vec<f64> = trades.iter().map(|t| t.holding_minutes()).collect();
    mean_f64(&mins)
}

// ─── Helpers ────────────────────────────────────────────────────────

pub fn daily_returns(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
