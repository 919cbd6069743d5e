// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The discovery orchestrator: phase sequencing, modes, reporting.
//!
//! Runs on its own worker thread inside the host process. The sequence:
//!
//! ```text
//! read config -> acquire globals/workstation -> acquire buses
//!   -> register targets -> primary browse (on the loop thread)
//!   -> one-shot: poll / bus browse / poll / backplane browse / poll
//!      monitor:  loop { snapshot every ~10s, trigger deeper browses
//!                       the first time their precondition holds }
//!   -> cleanup (always) -> final report -> D| -> disconnect
//! ```
//!
//! Bus/backplane browsing only happens once something was identified at
//! the level above; every polling loop honors the stop flag within one
//! sleep step; cleanup runs to completion once entered, whatever happened
//! before it.

pub mod context;
pub mod phases;
pub mod polling;

pub use context::{DeviceDetail, EnumeratorHandle, OrchestratorContext, SubscriptionHandle};
pub use phases::{BusBinding, CleanupStats, RegistrationStats, RetryPolicy};
pub use polling::{PollOutcome, PollPolicy};

use crate::apartment::{AffinityDispatcher, LoopHandle};
use crate::channel::{
    parse_control_line, ChannelError, ChannelOutput, ChannelTransport, ConfigBuilder, ControlLine,
    ProtocolError,
};
use crate::config::{self, HookConfig, HookMode};
use crate::host::{CallError, ObjRef};
use crate::logging::{ConsoleOutput, FileOutput, LogLevel};
use crate::snapshot::{self, TopologyCounts};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the hook waits for the controller's configuration.
const CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot cadence in monitor mode.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Stop-check step in monitor mode.
const MONITOR_STEP: Duration = Duration::from_millis(100);

/// What the loader hands the orchestrator: the host's loop thread and the
/// root services object everything else is navigated from.
pub struct HostRuntime {
    pub loop_handle: LoopHandle,
    pub root: ObjRef,
}

/// Fatal-for-the-run failures. Everything else is recovered locally and
/// shows up only in the log stream and counts.
#[derive(Debug)]
pub enum RunError {
    /// Channel connect/read/write failure before discovery could start.
    Channel(ChannelError),
    /// Configuration arrived but was unusable.
    Config(ProtocolError),
    /// Configuration never completed within the startup budget.
    ConfigTimeout,
    /// Stop signal before discovery started.
    Stopped,
    /// The host's object graph could not be navigated at all.
    Host(CallError),
    /// No configured bus could be acquired or created.
    NoBuses,
    /// The worker thread died.
    Internal(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "channel failure: {}", e),
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::ConfigTimeout => write!(f, "configuration never completed"),
            Self::Stopped => write!(f, "stopped before discovery started"),
            Self::Host(e) => write!(f, "host navigation failed: {}", e),
            Self::NoBuses => write!(f, "no configured bus could be acquired"),
            Self::Internal(s) => write!(f, "internal failure: {}", s),
        }
    }
}

impl std::error::Error for RunError {}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub counts: TopologyCounts,
    pub events: u64,
    /// `Some(true/false)` when target addresses were configured.
    pub targets_identified: Option<bool>,
    pub cleanup: CleanupStats,
}

/// The phase state machine for one run.
pub struct Orchestrator {
    runtime: HostRuntime,
    transport: Arc<ChannelTransport>,
    stop: Arc<AtomicBool>,
    dispatcher: AffinityDispatcher,
    ctx: Arc<OrchestratorContext>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(
        runtime: HostRuntime,
        transport: Arc<ChannelTransport>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let dispatcher = AffinityDispatcher::with_target(runtime.loop_handle.clone(), stop.clone());
        let ctx = OrchestratorContext::new(stop.clone());
        Self {
            runtime,
            transport,
            stop,
            dispatcher,
            ctx,
            started_at: Instant::now(),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    /// Run the whole sequence. The terminal `D|` and disconnect happen on
    /// every path, success or not.
    pub fn run(&self) -> Result<RunSummary, RunError> {
        let result = self.discover();
        config::clear();
        if let Err(ref e) = result {
            crate::error!("[run] fatal: {}", e);
        }
        let _ = self.transport.send_done();
        let _ = crate::logging::flush_logger();
        self.transport.disconnect();
        result
    }

    fn discover(&self) -> Result<RunSummary, RunError> {
        let config = self.read_config()?;
        self.retarget_logging(&config);

        crate::info!(
            "drivers: {}, mode: {}, logdir: {}",
            config.drivers.len(),
            config.mode.as_str(),
            config.log_dir.display()
        );
        for (i, driver) in config.drivers.iter().enumerate() {
            crate::info!(
                "  driver[{}]: {}, {} addresses{}",
                i,
                driver.name,
                driver.addresses.len(),
                if driver.new_driver { ", new" } else { "" }
            );
        }

        let globals = phases::acquire_globals(&self.runtime.root).map_err(RunError::Host)?;
        let workstation = phases::acquire_workstation(&globals).map_err(RunError::Host)?;
        crate::info!("[run] topology globals and workstation acquired");

        let bindings = phases::acquire_buses(
            &self.runtime.root,
            &workstation,
            &config,
            &self.stop,
            RetryPolicy::default(),
        );
        if bindings.is_empty() {
            return Err(RunError::NoBuses);
        }
        crate::info!(
            "[run] acquired {} of {} buses",
            bindings.len(),
            config.drivers.len()
        );

        phases::register_targets(&bindings);

        // Baseline topology before anything is started.
        if let Ok(document) = polling::take_snapshot(&globals) {
            let counts = snapshot::count_devices(&document);
            polling::report_snapshot(&self.ctx, Some(&self.transport), &document, counts);
            crate::info!("topology before browse: {}", counts);
        }

        crate::info!("=== primary browse (on host loop thread) ===");
        let primary_baseline = self.ctx.baseline();
        let started = self.dispatch_browse("primary", {
            let root = self.runtime.root.clone();
            let bindings = bindings.clone();
            move |ctx| phases::primary_browse(ctx, &root, &bindings)
        });
        if started == 0 {
            crate::warn!("[primary] nothing started - identification may never trigger");
        }

        match config.mode {
            HookMode::Monitor => self.monitor_loop(&config, &globals, &bindings),
            HookMode::OneShot => self.one_shot(&config, &globals, &bindings, primary_baseline),
        }

        crate::info!("=== cleanup ===");
        crate::info!(
            "tracked: {} subscriptions, {} enumerators",
            self.ctx.subscription_count(),
            self.ctx.enumerator_count()
        );
        let cleanup = self.cleanup_phase();

        // Stale configuration must be unreadable from here on.
        config::clear();

        Ok(self.final_report(&config, &globals, cleanup))
    }

    /// Read `C|` lines off the channel until `C|END`, then install the
    /// configuration. Malformed or absent configuration is fatal for the
    /// run - there is nothing sensible to discover without targets.
    fn read_config(&self) -> Result<Arc<HookConfig>, RunError> {
        let mut builder = ConfigBuilder::new();
        let deadline = Instant::now() + CONFIG_TIMEOUT;

        while !builder.is_complete() {
            if self.stop.load(Ordering::Relaxed) {
                return Err(RunError::Stopped);
            }
            if Instant::now() > deadline {
                return Err(RunError::ConfigTimeout);
            }
            match self.transport.read_line(Duration::from_millis(200)) {
                Ok(Some(line)) => {
                    let parsed = parse_control_line(&line);
                    if parsed == ControlLine::Stop {
                        return Err(RunError::Stopped);
                    }
                    builder.apply(&parsed);
                }
                Ok(None) => continue,
                Err(e) => return Err(RunError::Channel(e)),
            }
        }

        let config = builder.finish().map_err(RunError::Config)?;
        config::install(config.clone());
        crate::info!("[config] received over channel");
        Ok(Arc::new(config))
    }

    /// Move the log file into the configured directory and start teeing
    /// log lines to the controller.
    fn retarget_logging(&self, config: &HookConfig) {
        let path = config.log_dir.join("toposcan.log");
        match FileOutput::new(&path, LogLevel::Debug) {
            Ok(output) => {
                crate::logging::swap_file_output(Arc::new(output));
                crate::info!("=== toposcan log ({}) ===", path.display());
            }
            Err(e) => crate::warn!("[log] cannot open {}: {}", path.display(), e),
        }
        crate::logging::attach_tee(Some(Arc::new(ChannelOutput::new(
            self.transport.clone(),
            LogLevel::Info,
        ))));
    }

    /// Run a browse body on the host's loop thread, returning how many
    /// enumerations it started. Dispatch failures are phase failures, not
    /// run failures.
    fn dispatch_browse<F>(&self, label: &str, body: F) -> usize
    where
        F: FnOnce(&OrchestratorContext) -> usize + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let started = Arc::new(AtomicUsize::new(0));
        let started2 = started.clone();
        let result = self.dispatcher.execute(Box::new(move || {
            started2.store(body(&ctx), Ordering::Relaxed);
            Ok(())
        }));
        if let Err(e) = result {
            crate::warn!("[{}] dispatch failed: {}", label, e);
        }
        started.load(Ordering::Relaxed)
    }

    /// Cleanup runs on the loop thread like every other host call, but if
    /// the loop is unreachable it runs right here - leaked handles outlive
    /// the run and poison the host, which is worse than a wrong-thread
    /// teardown attempt.
    fn cleanup_phase(&self) -> CleanupStats {
        let ctx = self.ctx.clone();
        let slot = Arc::new(Mutex::new(CleanupStats::default()));
        let slot2 = slot.clone();
        let result = self.dispatcher.execute_ignoring_stop(Box::new(move || {
            *slot2.lock() = phases::run_cleanup(&ctx);
            Ok(())
        }));
        match result {
            Ok(()) => {
                let stats = *slot.lock();
                stats
            }
            Err(e) => {
                crate::warn!("[cleanup] dispatch failed ({}), running on worker thread", e);
                phases::run_cleanup(&self.ctx)
            }
        }
    }

    fn one_shot(
        &self,
        config: &HookConfig,
        globals: &ObjRef,
        bindings: &[BusBinding],
        primary_baseline: usize,
    ) {
        let targets = config.all_addresses();

        crate::info!("=== primary polling (2s interval, early exit on targets) ===");
        let outcome = polling::poll_phase(
            &self.ctx,
            globals,
            Some(&self.transport),
            &targets,
            primary_baseline,
            PollPolicy::primary(),
            "primary-poll",
        );
        if outcome == PollOutcome::Stopped {
            return;
        }
        if outcome == PollOutcome::TimedOut {
            crate::info!("[primary-poll] targets not identified in budget - proceeding anyway");
        }

        // Gate: deeper browsing needs at least one identified device.
        let counts = match polling::take_snapshot(globals) {
            Ok(document) => {
                let counts = snapshot::count_devices(&document);
                polling::report_snapshot(&self.ctx, Some(&self.transport), &document, counts);
                counts
            }
            Err(e) => {
                crate::warn!("[gate] snapshot unavailable: {}", e);
                TopologyCounts::default()
            }
        };
        crate::info!("topology after primary browse: {}", counts);

        if counts.identified_devices == 0 {
            crate::info!("=== bus browse skipped (no identified devices) ===");
            return;
        }

        crate::info!("=== bus browse (backplanes) ===");
        self.ctx.feed.clear_captured();
        self.ctx.feed.set_capturing(true);
        let bus_baseline = self.ctx.baseline();
        let probe = config.probe_details;
        let started = self.dispatch_browse("bus", {
            let bindings = bindings.to_vec();
            move |ctx| phases::bus_browse(ctx, &bindings, probe)
        });

        if started > 0 {
            crate::info!("=== bus polling (scoped to this phase) ===");
            polling::poll_phase(
                &self.ctx,
                globals,
                Some(&self.transport),
                &[],
                bus_baseline,
                PollPolicy::scoped(),
                "bus-poll",
            );
        } else {
            crate::warn!("[bus] nothing started - skipping bus polling");
        }

        self.ctx.feed.set_capturing(false);
        crate::info!(
            "=== backplane browse ({} buses captured from events) ===",
            self.ctx.feed.captured_count()
        );
        let backplane_baseline = self.ctx.baseline();
        let started = self.dispatch_browse("backplane", {
            let bindings = bindings.to_vec();
            move |ctx| phases::backplane_browse(ctx, &bindings)
        });

        if started > 0 {
            crate::info!("=== backplane polling (scoped to this phase) ===");
            polling::poll_phase(
                &self.ctx,
                globals,
                Some(&self.transport),
                &[],
                backplane_baseline,
                PollPolicy::scoped(),
                "backplane-poll",
            );
        }
    }

    fn monitor_loop(&self, config: &HookConfig, globals: &ObjRef, bindings: &[BusBinding]) {
        crate::info!("=== monitor mode: continuous browse ===");

        let mut bus_browse_done = false;
        let mut backplane_done = false;
        let mut snapshot_num = 0u32;
        let start = Instant::now();
        let mut next_poll = start + MONITOR_INTERVAL;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                crate::info!("[monitor] stop signal received");
                break;
            }
            if self.transport.check_stop() {
                crate::info!("[monitor] stop received over channel");
                self.stop.store(true, Ordering::Relaxed);
                break;
            }

            if Instant::now() >= next_poll {
                next_poll += MONITOR_INTERVAL;
                snapshot_num += 1;

                match polling::take_snapshot(globals) {
                    Ok(document) => {
                        let counts = snapshot::count_devices(&document);
                        polling::persist_snapshot(&document, "monitor", snapshot_num);
                        polling::report_snapshot(
                            &self.ctx,
                            Some(&self.transport),
                            &document,
                            counts,
                        );
                        crate::info!(
                            "[monitor] snapshot {} @ {}s: {}, {} events",
                            snapshot_num,
                            start.elapsed().as_secs(),
                            counts,
                            self.ctx.feed.event_count()
                        );

                        if !bus_browse_done && counts.identified_devices > 0 {
                            crate::info!("[monitor] devices identified - triggering bus browse");
                            self.ctx.feed.clear_captured();
                            self.ctx.feed.set_capturing(true);
                            let probe = config.probe_details;
                            self.dispatch_browse("bus", {
                                let bindings = bindings.to_vec();
                                move |ctx| phases::bus_browse(ctx, &bindings, probe)
                            });
                            bus_browse_done = true;
                        }

                        if bus_browse_done
                            && !backplane_done
                            && self.ctx.feed.captured_count() > 0
                        {
                            self.ctx.feed.set_capturing(false);
                            crate::info!(
                                "[monitor] {} buses captured - triggering backplane browse",
                                self.ctx.feed.captured_count()
                            );
                            self.dispatch_browse("backplane", {
                                let bindings = bindings.to_vec();
                                move |ctx| phases::backplane_browse(ctx, &bindings)
                            });
                            backplane_done = true;
                        }

                        self.write_results(config, Some(snapshot_num), counts, None);
                    }
                    Err(e) => crate::warn!("[monitor] snapshot unavailable: {}", e),
                }
            }

            std::thread::sleep(MONITOR_STEP);
        }
    }

    fn final_report(
        &self,
        config: &HookConfig,
        globals: &ObjRef,
        cleanup: CleanupStats,
    ) -> RunSummary {
        crate::info!("=== final results ===");

        let targets = config.all_addresses();
        let (counts, identified) = match polling::take_snapshot(globals) {
            Ok(document) => {
                let counts = snapshot::count_devices(&document);
                polling::report_snapshot(&self.ctx, Some(&self.transport), &document, counts);
                let identified = (!targets.is_empty())
                    .then(|| snapshot::is_target_identified(&document, &targets));
                (counts, identified)
            }
            Err(e) => {
                crate::warn!("[final] snapshot unavailable: {}", e);
                (TopologyCounts::default(), None)
            }
        };

        crate::info!("final topology: {}", counts);
        if let Some(identified) = identified {
            crate::info!(
                "target addresses identified: {}",
                if identified { "YES" } else { "NO" }
            );
        }
        crate::info!("events received: {}", self.ctx.feed.event_count());

        self.write_results(config, None, counts, identified);

        RunSummary {
            counts,
            events: self.ctx.feed.event_count() as u64,
            targets_identified: identified,
            cleanup,
        }
    }

    /// Write the results summary the surrounding tooling watches for.
    fn write_results(
        &self,
        config: &HookConfig,
        snapshot_num: Option<u32>,
        counts: TopologyCounts,
        identified: Option<bool>,
    ) {
        let text = render_results(
            config,
            snapshot_num,
            counts,
            self.ctx.feed.event_count(),
            self.started_at.elapsed(),
            identified,
            &self.ctx,
        );
        let path = config.log_dir.join("results.txt");
        if let Err(e) = std::fs::write(&path, text) {
            crate::warn!("[results] cannot write {}: {}", path.display(), e);
        }
    }
}

/// Render the results file contents.
fn render_results(
    config: &HookConfig,
    snapshot_num: Option<u32>,
    counts: TopologyCounts,
    events: usize,
    elapsed: Duration,
    identified: Option<bool>,
    ctx: &OrchestratorContext,
) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "MODE: {}", config.mode.as_str());
    if let Some(n) = snapshot_num {
        let _ = writeln!(out, "SNAPSHOT: {}", n);
    }
    let _ = writeln!(out, "DRIVERS: {}", config.drivers.len());
    let _ = writeln!(out, "DEVICES_IDENTIFIED: {}", counts.identified_devices);
    let _ = writeln!(out, "DEVICES_TOTAL: {}", counts.total_devices);
    let _ = writeln!(out, "EVENTS: {}", events);
    let _ = writeln!(out, "ELAPSED: {}", elapsed.as_secs());
    if let Some(identified) = identified {
        if let Some(first) = config.all_addresses().first() {
            let _ = writeln!(out, "TARGET: {}", first);
        }
        let _ = writeln!(
            out,
            "TARGET_STATUS: {}",
            if identified { "IDENTIFIED" } else { "NOT_FOUND" }
        );
    }
    let mut devices: Vec<DeviceDetail> =
        ctx.devices.iter().map(|entry| entry.value().clone()).collect();
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    for device in devices {
        let _ = writeln!(
            out,
            "DEVICE: {} | {}",
            device.address.as_deref().unwrap_or("(no address)"),
            device.name
        );
    }
    out
}

/// Handle to a started hook: the stop flag and the worker thread.
///
/// Dropping the handle signals stop and joins, so an unload can never
/// leave the worker running.
pub struct Hook {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<RunSummary, RunError>>>,
}

impl Hook {
    /// Raise the stop flag without waiting.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// The flag shared with every suspension point.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Wait for the worker to finish and take its outcome.
    pub fn join(mut self) -> Result<RunSummary, RunError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(RunError::Internal("worker thread panicked".into()))),
            None => Err(RunError::Internal("worker already joined".into())),
        }
    }

    /// Signal stop, then wait.
    pub fn stop(self) -> Result<RunSummary, RunError> {
        self.signal_stop();
        self.join()
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start the orchestrator worker: connect the channel, read configuration,
/// run discovery, report, tear down. This is the entry point the loader
/// calls once the crate's code is in the host process.
pub fn start(runtime: HostRuntime, endpoint: &str) -> Hook {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let endpoint = endpoint.to_string();

    let handle = std::thread::spawn(move || {
        // Log somewhere immediately; the configured directory replaces
        // this once the controller has spoken.
        let scratch = std::env::temp_dir().join("toposcan_boot.log");
        match FileOutput::new(&scratch, LogLevel::Debug) {
            Ok(output) => crate::logging::init_logger(Arc::new(output), LogLevel::Debug),
            Err(_) => crate::logging::init_logger(
                Arc::new(ConsoleOutput::new(LogLevel::Debug)),
                LogLevel::Debug,
            ),
        }
        crate::info!(
            "=== toposcan worker started (pid {}) ===",
            std::process::id()
        );

        let transport = match ChannelTransport::connect(&endpoint, Duration::from_secs(5)) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                crate::error!("[channel] cannot reach controller at {}: {}", endpoint, e);
                return Err(RunError::Channel(e));
            }
        };
        crate::info!("[channel] connected to controller at {}", endpoint);

        let orchestrator = Orchestrator::new(runtime, transport, stop2);
        orchestrator.run()
    });

    Hook {
        stop,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apartment::MessageLoop;
    use crate::config::DriverTarget;
    use std::path::PathBuf;

    #[test]
    fn test_render_results_shape() {
        let config = HookConfig {
            drivers: vec![DriverTarget {
                name: "AB_ETH-1".into(),
                addresses: vec!["10.0.0.5".into()],
                new_driver: false,
            }],
            mode: HookMode::OneShot,
            log_dir: PathBuf::from("/tmp"),
            debug_snapshots: false,
            probe_details: false,
        };
        let ctx = OrchestratorContext::new(Arc::new(AtomicBool::new(false)));
        ctx.record_device("1756-L85E", "obj-17");
        ctx.set_device_address("1756-L85E", "10.0.0.5");
        ctx.record_device("1794-AENT", "obj-22");

        let counts = TopologyCounts {
            total_devices: 4,
            identified_devices: 2,
        };
        let text = render_results(
            &config,
            None,
            counts,
            37,
            Duration::from_secs(41),
            Some(true),
            &ctx,
        );

        assert!(text.contains("MODE: oneshot\n"));
        assert!(text.contains("DEVICES_IDENTIFIED: 2\n"));
        assert!(text.contains("DEVICES_TOTAL: 4\n"));
        assert!(text.contains("EVENTS: 37\n"));
        assert!(text.contains("ELAPSED: 41\n"));
        assert!(text.contains("TARGET: 10.0.0.5\n"));
        assert!(text.contains("TARGET_STATUS: IDENTIFIED\n"));
        assert!(text.contains("DEVICE: 10.0.0.5 | 1756-L85E\n"));
        assert!(text.contains("DEVICE: (no address) | 1794-AENT\n"));
        assert!(!text.contains("SNAPSHOT:"));
    }

    #[test]
    fn test_render_results_monitor_snapshot_line() {
        let config = HookConfig {
            drivers: vec![DriverTarget {
                name: "AB_ETH-1".into(),
                addresses: vec![],
                new_driver: false,
            }],
            mode: HookMode::Monitor,
            ..Default::default()
        };
        let ctx = OrchestratorContext::new(Arc::new(AtomicBool::new(false)));
        let text = render_results(
            &config,
            Some(7),
            TopologyCounts::default(),
            0,
            Duration::from_secs(70),
            None,
            &ctx,
        );
        assert!(text.contains("MODE: monitor\n"));
        assert!(text.contains("SNAPSHOT: 7\n"));
        assert!(!text.contains("TARGET_STATUS"));
    }

    #[test]
    fn test_start_fails_cleanly_without_controller() {
        let (lp, loop_handle) = MessageLoop::new();
        let joiner = std::thread::spawn(move || lp.run());

        let runtime = HostRuntime {
            loop_handle: loop_handle.clone(),
            root: crate::host::HostObject::builder("root").build(),
        };
        // Port 9 is discard/unassigned; nothing listens there in tests.
        let hook = start(runtime, "127.0.0.1:9");
        let result = hook.join();
        assert!(matches!(result, Err(RunError::Channel(_))));

        loop_handle.quit();
        joiner.join().unwrap();
    }
}
