//! zonebreak runner: scheduling and simulation on top of `zonebreak-core`.
//!
//! This crate provides:
//! - The live monitor (global scanner, bounded monitor pool, execution bridge)
//! - Candle loading with cache/download/synthetic fallback
//! - The deterministic single-threaded backtest simulator
//! - Performance metrics and artifact export (trades.csv, equity.csv, metrics.json)

pub mod backtest;
pub mod data_loader;
pub mod export;
pub mod metrics;
pub mod monitor;

#[cfg(test)]
mod testing;

pub use backtest::{
    run_backtest, run_loaded, BacktestConfig, BacktestError, BacktestReport, EquityPoint, SignalStats,
};
pub use data_loader::{load_candles, CandleSource, LoadError, LoadOptions, LoadedData};
pub use export::{load_summary, render_summary, save_artifacts, ExportError, MetricsSummary};
pub use metrics::PerformanceMetrics;
pub use monitor::{Monitor, SharedState};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn shared_state_is_send_sync() {
        assert_send::<SharedState>();
        assert_sync::<SharedState>();
    }

    #[test]
    fn monitor_handle_is_send() {
        assert_send::<Monitor>();
    }

    #[test]
    fn report_types_are_send_sync() {
        assert_send::<BacktestReport>();
        assert_sync::<BacktestReport>();
        assert_send::<PerformanceMetrics>();
        assert_sync::<PerformanceMetrics>();
        assert_send::<MetricsSummary>();
        assert_sync::<MetricsSummary>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<BacktestConfig>();
        assert_sync::<BacktestConfig>();
        assert_send::<LoadOptions>();
        assert_sync::<LoadOptions>();
    }
}
