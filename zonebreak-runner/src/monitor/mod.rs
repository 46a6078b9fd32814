//! Live monitor: a coarse scanner over the universe and a fine-grained tick
//! over the monitor pool, both feeding one bounded worker pool.
//!
//! ```text
//!  zonebreak-scanner ──every scan interval──┐
//!                                           ├──> rayon pool (WORKER_THREADS) ──> evaluate_symbol
//!  zonebreak-monitor ──every tick interval──┘
//! ```
//!
//! Everything the two threads share lives in [`SharedState`].

pub mod evaluate;
pub mod execution;
pub mod pool;
pub mod registry;
pub mod trend_cache;

pub use evaluate::{evaluate_symbol, EvalOutcome};
pub use execution::{EntryError, ExecutionBridge};
pub use pool::{MonitorPool, PoolChange};
pub use registry::{SharedTracker, ZoneRegistry};
pub use trend_cache::TrendCache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};
use zonebreak_core::config::Settings;
use zonebreak_core::data::{resolve_universe, MarketDataFeed};
use zonebreak_core::domain::{Position, Timeframe};
use zonebreak_core::gateway::ExecutionGateway;
use zonebreak_core::ranker::rank;
use zonebreak_core::risk::{ClosedPosition, PendingEntries, RiskManager};
use zonebreak_core::sync::lock;

/// Sleeps are cut into slices this long so shutdown is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// State shared by the scanner, the monitor tick and every pool job.
pub struct SharedState {
    pub settings: Settings,
    pub universe: Vec<String>,
    pub registry: ZoneRegistry,
    pub pool: Mutex<MonitorPool>,
    pub risk: RiskManager,
    pub pending: Mutex<PendingEntries>,
    pub trend: TrendCache,
    pub bridge: ExecutionBridge,
    pub feed: Arc<dyn MarketDataFeed>,
}

impl SharedState {
    pub fn new(
        settings: Settings,
        ladder: Vec<Timeframe>,
        universe: Vec<String>,
        feed: Arc<dyn MarketDataFeed>,
        gateway: Arc<dyn ExecutionGateway>,
    ) -> Self {
        Self {
            registry: ZoneRegistry::new(settings.zones.clone()),
            pool: Mutex::new(MonitorPool::new(
                settings.max_monitor_pool_size,
                settings.pool_demote_after_scans,
            )),
            risk: RiskManager::new(settings.risk.clone()),
            pending: Mutex::new(PendingEntries::new(settings.zones.retest_window_bars)),
            trend: TrendCache::new(ladder, settings.trend_slope_lookback, trend_cache::DEFAULT_TTL),
            bridge: ExecutionBridge::new(gateway, settings.leverage()),
            universe,
            feed,
            settings,
        }
    }
}

/// Handle to the running scanner and monitor threads.
pub struct Monitor {
    state: Arc<SharedState>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Validate, resolve the universe, clear orphans, then spawn both loops.
    ///
    /// Every fatal condition is reported here, before any worker exists.
    /// Raising `shutdown` at any point, even before this returns, makes both
    /// loops exit after their current iteration.
    pub fn start(
        settings: Settings,
        feed: Arc<dyn MarketDataFeed>,
        gateway: Arc<dyn ExecutionGateway>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        settings.validate().context("invalid settings")?;
        settings.require_credentials().context("live trading needs API credentials")?;
        let ladder = settings.ladder()?;

        let universe = resolve_universe(&settings.symbols, settings.universe_n, Some(feed.as_ref()))
            .context("failed to resolve the symbol universe")?;
        if universe.is_empty() {
            bail!("symbol universe is empty");
        }

        let state = Arc::new(SharedState::new(settings, ladder, universe, feed, gateway));
        if state.settings.clear_orphan_positions {
            let cleared = state
                .bridge
                .clear_orphans(&state.risk)
                .context("orphan position cleanup failed")?;
            if !cleared.is_empty() {
                info!(count = cleared.len(), symbols = ?cleared, "orphan positions closed");
            }
        }

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(state.settings.worker_threads())
            .thread_name(|i| format!("zonebreak-pool-{i}"))
            .build()
            .context("failed to build worker pool")?;
        let workers = Arc::new(workers);

        info!(
            universe = state.universe.len(),
            pool = state.settings.max_monitor_pool_size,
            workers = state.settings.worker_threads(),
            max_positions = state.risk.params().max_positions,
            dry_run = state.settings.dry_run,
            gateway = state.bridge.gateway().name(),
            "monitor starting"
        );

        let mut monitor = Monitor {
            state: Arc::clone(&state),
            shutdown: Arc::clone(&shutdown),
            handles: Vec::with_capacity(2),
        };

        let scanner = spawn_loop(
            "zonebreak-scanner",
            Arc::clone(&state),
            Arc::clone(&workers),
            Arc::clone(&shutdown),
            state.settings.scan_interval(),
            run_scan,
        )?;
        monitor.handles.push(scanner);

        let ticker = spawn_loop(
            "zonebreak-monitor",
            Arc::clone(&state),
            workers,
            Arc::clone(&shutdown),
            state.settings.monitor_interval(),
            run_tick,
        );
        match ticker {
            Ok(handle) => monitor.handles.push(handle),
            Err(e) => {
                monitor.stop();
                return Err(e);
            }
        }
        Ok(monitor)
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Stop and join. Open positions are left as they are.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.join();
    }

    /// Wait until the loops exit (after the shutdown flag is raised).
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("monitor").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "monitor thread panicked");
            }
        }
        info!("monitor stopped");
    }

    pub fn positions(&self) -> Vec<Position> {
        self.state.risk.book().snapshot()
    }

    pub fn pool_members(&self) -> Vec<String> {
        lock(&self.state.pool).members()
    }

    /// Flatten `symbol` outside the stop logic.
    pub fn request_close(&self, symbol: &str) -> anyhow::Result<Option<ClosedPosition>> {
        let state = &self.state;
        let Some(position) = state.risk.book().get(symbol) else {
            return Ok(None);
        };
        let mark = state.registry.last_close(symbol).unwrap_or(position.entry_price);
        state
            .bridge
            .close_external(&state.risk, symbol, mark)
            .with_context(|| format!("failed to close {symbol}"))
    }
}

fn spawn_loop(
    name: &str,
    state: Arc<SharedState>,
    workers: Arc<ThreadPool>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    step: fn(&SharedState, &ThreadPool),
) -> anyhow::Result<JoinHandle<()>> {
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            debug!(thread = %thread_name, "loop started");
            while !shutdown.load(Ordering::SeqCst) {
                let started = Instant::now();
                step(&state, &workers);
                sleep_until_next(interval.saturating_sub(started.elapsed()), &shutdown);
            }
            debug!(thread = %thread_name, "loop exited");
        })
        .with_context(|| format!("failed to spawn {name} thread"))
}

/// Sleep for `total`, waking every slice to check `shutdown`.
fn sleep_until_next(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Coarse pass: every universe symbol, then rank and rebalance the pool.
pub fn run_scan(state: &SharedState, workers: &ThreadPool) {
    let started = Instant::now();
    let retried = state.bridge.retry_failed_exits(&state.risk);
    if !retried.is_empty() {
        info!(count = retried.len(), "pending exits completed");
    }

    let (total, skipped) = evaluate_all(state, workers, &state.universe);

    let ranked = rank(state.registry.candidates());
    let book = state.risk.book();
    let change = lock(&state.pool).rebalance(&ranked, &book.symbols(), book.is_full());
    for symbol in &change.promoted {
        info!(symbol = %symbol, "promoted to monitor pool");
    }
    for symbol in &change.demoted {
        info!(symbol = %symbol, "demoted from monitor pool");
    }

    info!(
        symbols = state.universe.len(),
        skipped,
        candidates = ranked.len(),
        pool = lock(&state.pool).len(),
        positions = book.len(),
        triggers = total.triggers,
        entries = total.entries,
        exits = total.exits,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "scan complete"
    );
}

/// Fine pass: pool members only.
pub fn run_tick(state: &SharedState, workers: &ThreadPool) {
    let members = lock(&state.pool).members();
    if members.is_empty() {
        return;
    }
    let (total, _) = evaluate_all(state, workers, &members);
    if total.entries + total.exits > 0 {
        info!(members = members.len(), entries = total.entries, exits = total.exits, "monitor tick");
    }
}

/// Evaluate `symbols` on the worker pool and wait for the whole batch.
fn evaluate_all(state: &SharedState, workers: &ThreadPool, symbols: &[String]) -> (EvalOutcome, usize) {
    let results: Vec<_> = workers.install(|| {
        symbols
            .par_iter()
            .map(|symbol| (symbol, evaluate_symbol(state, symbol)))
            .collect()
    });

    let mut total = EvalOutcome::default();
    let mut skipped = 0;
    for (symbol, result) in results {
        match result {
            Ok(outcome) => total += outcome,
            Err(e) if e.is_skippable() => {
                skipped += 1;
                debug!(symbol = %symbol, error = %e, "symbol skipped this cycle");
            }
            Err(e) => {
                skipped += 1;
                warn!(symbol = %symbol, error = %e, "symbol evaluation failed");
            }
        }
    }
    (total, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use zonebreak_core::domain::{ExitReason, Side, ZoneId};
    use zonebreak_core::gateway::{ExchangePosition, PaperGateway};
    use zonebreak_core::zones::EntrySignal;

    use crate::testing::{breakout_series, ScriptedFeed, RALLY};

    fn settings() -> Settings {
        Settings {
            symbols: vec!["AAA".into(), "BBB".into()],
            monitor_interval_seconds: 1,
            global_scan_interval_seconds: 1,
            worker_threads: Some(2),
            ..Settings::default()
        }
    }

    fn entry(symbol: &str) -> EntrySignal {
        EntrySignal {
            symbol: symbol.into(),
            zone_id: ZoneId(7),
            side: Side::Long,
            entry_price: 101.0,
            stop_price: 99.0,
            bar_index: 90,
            signal_time: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap(),
            zone_top: 100.0,
            zone_bottom: 99.0,
            breakout_level: 100.3,
            dwell_bars: 20,
            touches: 4,
        }
    }

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn feed() -> Arc<ScriptedFeed> {
        let feed = Arc::new(ScriptedFeed::new());
        feed.insert(breakout_series("AAA", &RALLY));
        feed
    }

    #[test]
    fn live_mode_without_credentials_fails_before_spawning() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let settings = Settings {
            dry_run: false,
            ..settings()
        };
        let err = Monitor::start(settings, feed(), gw.clone(), running()).err().unwrap();
        assert!(format!("{err:#}").contains("credentials"));
        assert!(gw.calls().is_empty());
    }

    #[test]
    fn invalid_settings_fail_fast() {
        let settings = Settings {
            monitor_interval_seconds: 0,
            ..settings()
        };
        let result = Monitor::start(settings, feed(), Arc::new(PaperGateway::new(1_000.0)), running());
        assert!(result.is_err());
    }

    #[test]
    fn start_clears_orphans_and_stops_promptly() {
        let gw = Arc::new(PaperGateway::new(1_000.0));
        gw.seed_position(ExchangePosition {
            symbol: "XRPUSDT".into(),
            qty: 50.0,
            entry_price: 0.5,
        });
        let monitor = Monitor::start(settings(), feed(), gw.clone(), running()).unwrap();
        assert!(gw.get_open_positions().unwrap().is_empty());

        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn scan_promotes_symbols_with_live_zones() {
        let feed = feed();
        feed.reveal("AAA", 80);
        let feed_dyn: Arc<dyn MarketDataFeed> = feed.clone();
        let gw: Arc<dyn ExecutionGateway> = Arc::new(PaperGateway::new(1_000.0));
        let settings = settings();
        let ladder = settings.ladder().unwrap();
        let state = SharedState::new(settings, ladder, vec!["AAA".into(), "BBB".into()], feed_dyn, gw);
        let workers = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        run_scan(&state, &workers);
        // BBB has no data and is skipped; AAA sits in a qualified range
        assert!(state.registry.get("BBB").is_some());
        assert_eq!(lock(&state.pool).members(), vec!["AAA"]);

        run_tick(&state, &workers);
        assert!(state.risk.book().is_empty());
    }

    #[test]
    fn interrupt_before_start_returns_promptly() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let feed = feed();
        let monitor = Monitor::start(settings(), feed.clone(), Arc::new(PaperGateway::new(1_000.0)), shutdown).unwrap();

        let started = Instant::now();
        monitor.join();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(feed.calls(), 0);
    }

    #[test]
    fn request_close_flattens_at_the_last_close() {
        let feed = feed();
        feed.reveal("AAA", 80);
        let feed_dyn: Arc<dyn MarketDataFeed> = feed.clone();
        let gw = Arc::new(PaperGateway::new(1_000.0));
        let gateway: Arc<dyn ExecutionGateway> = gw.clone();
        let settings = settings();
        let ladder = settings.ladder().unwrap();
        let state = SharedState::new(settings, ladder, vec!["AAA".into()], feed_dyn, gateway);
        let monitor = Monitor {
            state: Arc::new(state),
            shutdown: running(),
            handles: Vec::new(),
        };
        let workers = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        run_scan(monitor.state(), &workers);
        let last_close = monitor.state().registry.last_close("AAA").unwrap();

        assert!(monitor.request_close("AAA").unwrap().is_none());

        let position = monitor.state().bridge.enter(&monitor.state().risk, &entry("AAA"), true).unwrap();
        assert_eq!(gw.resting_stops("AAA"), vec![position.stop_price]);

        let closed = monitor.request_close("AAA").unwrap().unwrap();
        assert_eq!(closed.reason, ExitReason::External);
        assert_eq!(closed.exit_price, last_close);
        assert!(monitor.positions().is_empty());
        assert!(gw.resting_stops("AAA").is_empty());
        assert!(gw.get_open_positions().unwrap().is_empty());
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let flag = AtomicBool::new(true);
        let started = Instant::now();
        sleep_until_next(Duration::from_secs(10), &flag);
        assert!(started.elapsed() < SLEEP_SLICE);
    }
}
