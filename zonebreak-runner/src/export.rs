//! Backtest artifacts: CSV trade ledger, equity curves and a JSON summary.
//!
//! Written under `{export_dir}/`:
//! - `trades.csv`: one row per closed trade
//! - `equity.csv`: closed-trade equity and daily marks
//! - `metrics.json`: summary metrics plus the ledger hash
//!
//! The ledger hash is BLAKE3 over the exact `trades.csv` bytes, so two runs
//! can be compared without diffing files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use zonebreak_core::domain::BacktestTrade;

use crate::backtest::{BacktestReport, EquityPoint, SignalStats};
use crate::metrics::PerformanceMetrics;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv output is not valid UTF-8")]
    Utf8,

    #[error("unsupported schema version {found} (max supported: {SCHEMA_VERSION})")]
    Schema { found: u32 },
}

/// Contents of `metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub schema_version: u32,
    pub symbols: Vec<String>,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub initial_balance: f64,
    pub metrics: PerformanceMetrics,
    pub stats: SignalStats,
    pub ledger_hash: String,
    pub dataset_hash: String,
    pub has_synthetic: bool,
}

impl MetricsSummary {
    pub fn from_report(report: &BacktestReport) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            symbols: report.symbols.clone(),
            start: report.start,
            end: report.end,
            initial_balance: report.initial_balance,
            metrics: report.metrics.clone(),
            stats: report.stats.clone(),
            ledger_hash: report.ledger_hash.clone(),
            dataset_hash: report.dataset_hash.clone(),
            has_synthetic: report.has_synthetic,
        }
    }
}

// ─── CSV export ─────────────────────────────────────────────────────

/// Columns: symbol, side, entry_time, entry_price, exit_time, exit_price,
/// size, fees, slippage, net_pnl, mfe_r, mae_r, r_multiple, exit_reason,
/// trend_aligned
pub fn export_trades_csv(trades: &[BacktestTrade]) -> Result<String, ExportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "symbol",
        "side",
        "entry_time",
        "entry_price",
        "exit_time",
        "exit_price",
        "size",
        "fees",
        "slippage",
        "net_pnl",
        "mfe_r",
        "mae_r",
        "r_multiple",
        "exit_reason",
        "trend_aligned",
    ])?;

    for t in trades {
        wtr.write_record([
            &t.symbol,
            &t.side.to_string(),
            &t.entry_time.to_rfc3339(),
            &format!("{:.8}", t.entry_price),
            &t.exit_time.to_rfc3339(),
            &format!("{:.8}", t.exit_price),
            &format!("{:.8}", t.size),
            &format!("{:.6}", t.fees),
            &format!("{:.6}", t.slippage),
            &format!("{:.6}", t.net_pnl),
            &format!("{:.4}", t.mfe_r),
            &format!("{:.4}", t.mae_r),
            &format!("{:.4}", t.r_multiple),
            &t.exit_reason.to_string(),
            &t.trend_aligned.to_string(),
        ])?;
    }

    let data = wtr.into_inner().map_err(|e| ExportError::Csv(e.into_error().into()))?;
    String::from_utf8(data).map_err(|_| ExportError::Utf8)
}

/// Columns: series (`closed` or `daily`), time, equity
pub fn export_equity_csv(closed: &[EquityPoint], daily: &[EquityPoint]) -> Result<String, ExportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["series", "time", "equity"])?;
    for (series, points) in [("closed", closed), ("daily", daily)] {
        for p in points {
            wtr.write_record([series, &p.time.to_rfc3339(), &format!("{:.2}", p.equity)])?;
        }
    }
    let data = wtr.into_inner().map_err(|e| ExportError::Csv(e.into_error().into()))?;
    String::from_utf8(data).map_err(|_| ExportError::Utf8)
}

/// BLAKE3 of the `trades.csv` bytes.
pub fn ledger_hash(trades: &[BacktestTrade]) -> Result<String, ExportError> {
    let csv = export_trades_csv(trades)?;
    Ok(blake3::hash(csv.as_bytes()).to_hex().to_string())
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Write `trades.csv`, `equity.csv` and `metrics.json` into `export_dir`.
pub fn save_artifacts(report: &BacktestReport, export_dir: &Path) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(export_dir).map_err(|source| ExportError::Io {
        path: export_dir.to_path_buf(),
        source,
    })?;

    write(export_dir.join("trades.csv"), export_trades_csv(&report.trades)?)?;
    write(
        export_dir.join("equity.csv"),
        export_equity_csv(&report.equity_curve, &report.daily_equity)?,
    )?;
    let summary = MetricsSummary::from_report(report);
    write(export_dir.join("metrics.json"), serde_json::to_string_pretty(&summary)?)?;

    info!(dir = %export_dir.display(), trades = report.trades.len(), "artifacts written");
    Ok(export_dir.to_path_buf())
}

/// Read `metrics.json` back, rejecting newer schema versions.
pub fn load_summary(export_dir: &Path) -> Result<MetricsSummary, ExportError> {
    let path = export_dir.join("metrics.json");
    let json = fs::read_to_string(&path).map_err(|source| ExportError::Io { path, source })?;
    let summary: MetricsSummary = serde_json::from_str(&json)?;
    if summary.schema_version > SCHEMA_VERSION {
        return Err(ExportError::Schema {
            found: summary.schema_version,
        });
    }
    Ok(summary)
}

// ─── Text summary ───────────────────────────────────────────────────

/// Plain-text summary for the terminal.
pub fn render_summary(report: &BacktestReport) -> String {
    let m = &report.metrics;
    let mut out = String::new();
    out.push_str(&format!(
        "Backtest {} → {} ({} symbols, {} candles){}\n",
        report.start.format("%Y-%m-%d %H:%M"),
        report.end.format("%Y-%m-%d %H:%M"),
        report.symbols.len(),
        report.candle_count,
        if report.has_synthetic { " [SYNTHETIC]" } else { "" },
    ));
    out.push_str(&format!("  Trades:          {}\n", m.trade_count));
    out.push_str(&format!("  Win rate:        {:.1}%\n", m.win_rate * 100.0));
    out.push_str(&format!("  Profit factor:   {:.2}\n", m.profit_factor));
    out.push_str(&format!("  Total return:    {:.2}%\n", m.total_return * 100.0));
    out.push_str(&format!("  CAGR:            {:.2}%\n", m.cagr * 100.0));
    out.push_str(&format!("  Max drawdown:    {:.2}%\n", m.max_drawdown * 100.0));
    out.push_str(&format!("  Avg R:           {:.2}\n", m.avg_r));
    out.push_str(&format!("  Expectancy (R):  {:.2}\n", m.expectancy_r));
    out.push_str(&format!("  Sharpe:          {:.2}\n", m.sharpe));
    out.push_str(&format!("  Avg holding:     {:.0} min\n", m.avg_holding_minutes));
    out.push_str(&format!("  Final equity:    {:.2}\n", m.final_equity));
    out.push_str(&format!(
        "  Triggers:        {} ({} entered, {} at cap)\n",
        report.stats.triggers, report.stats.entries, report.stats.cap_rejections
    ));
    out.push_str(&format!("  Ledger hash:     {}\n", report.ledger_hash));
    out
}

// ─── Helpers ────────────────────────────────────────────────────────

fn write(path: PathBuf, contents: String) -> Result<(), ExportError> {
    fs::write(&path, contents).map_err(|source| ExportError::Io { path, source })
}
