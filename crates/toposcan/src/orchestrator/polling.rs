// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Snapshot polling loops.
//!
//! Discovery never reports completion synchronously; the orchestrator
//! watches it converge by polling topology snapshots and the sinks'
//! cycle flags. Each phase polls with the same shape: bounded budget,
//! short sleep steps (so a stop signal is honored within one step), a
//! minimum run time before early exits are trusted, and two early exits -
//! all of this phase's enumerators report a completed cycle, or every
//! requested target address shows up identified. Both exits are "good
//! enough" heuristics, not proofs; a timeout just means "proceed with
//! whatever was discovered".

use super::context::OrchestratorContext;
use crate::channel::ChannelTransport;
use crate::config;
use crate::host::{call_str, CallError, ObjRef, SlotOp};
use crate::snapshot::{self, TopologyCounts};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Timing knobs for one polling phase.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// How often a snapshot is taken.
    pub interval: Duration,
    /// Total budget before the phase gives up and proceeds.
    pub budget: Duration,
    /// Early exits are ignored before this much time has passed (a cycle
    /// flag in the first instants usually means the source raced us).
    pub min_run: Duration,
    /// Sleep step between checks; bounds stop-signal latency.
    pub step: Duration,
}

impl PollPolicy {
    /// Policy for the top-level browse phase.
    pub fn primary() -> Self {
        Self {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(30),
            min_run: Duration::from_secs(3),
            step: Duration::from_millis(100),
        }
    }

    /// Policy for the scoped bus/backplane phases.
    pub fn scoped() -> Self {
        Self {
            min_run: Duration::from_secs(2),
            ..Self::primary()
        }
    }
}

/// Why a polling phase returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every enumerator started by this phase completed a cycle.
    AllCycled,
    /// Every requested target address is identified in the snapshot.
    TargetsIdentified,
    /// Budget exhausted; proceed with partial results.
    TimedOut,
    /// Stop signal observed.
    Stopped,
}

/// Pull one topology snapshot from the host.
pub fn take_snapshot(globals: &ObjRef) -> Result<String, CallError> {
    call_str(globals, SlotOp::DumpTopology, &[])
}

/// Forward a snapshot and its counts to the controller and fold its
/// addresses into the device table.
pub fn report_snapshot(
    ctx: &OrchestratorContext,
    transport: Option<&ChannelTransport>,
    document: &str,
    counts: TopologyCounts,
) {
    if let Some(transport) = transport {
        let _ = transport.send_snapshot(document);
        let _ = transport.send_status(
            counts.total_devices,
            counts.identified_devices,
            ctx.feed.event_count() as u64,
        );
    }
    for (name, address) in snapshot::device_addresses(document) {
        ctx.set_device_address(&name, &address);
    }
}

/// Keep a numbered snapshot file when the configuration asks for it.
pub(crate) fn persist_snapshot(document: &str, label: &str, seq: u32) {
    let Some(config) = config::current() else {
        return;
    };
    if !config.debug_snapshots {
        return;
    }
    let path = config.log_dir.join(format!("topo_{}_{}.xml", label, seq));
    if let Err(e) = std::fs::write(&path, document) {
        crate::warn!("[poll] could not persist snapshot {}: {}", path.display(), e);
    }
}

/// Run one polling phase to an outcome.
///
/// `baseline` scopes cycle checks to enumerators registered by the phase
/// being watched; `targets` enables the identified-targets early exit
/// (empty disables it).
pub fn poll_phase(
    ctx: &OrchestratorContext,
    globals: &ObjRef,
    transport: Option<&ChannelTransport>,
    targets: &[String],
    baseline: usize,
    policy: PollPolicy,
    label: &str,
) -> PollOutcome {
    let start = Instant::now();
    let mut next_poll = start + policy.interval;
    let mut seq = 0u32;

    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            crate::info!("[{}] stop signal observed", label);
            return PollOutcome::Stopped;
        }
        if let Some(transport) = transport {
            if transport.check_stop() {
                crate::info!("[{}] stop received over channel", label);
                ctx.stop.store(true, Ordering::Relaxed);
                return PollOutcome::Stopped;
            }
        }

        let elapsed = start.elapsed();

        if elapsed >= policy.min_run && ctx.cycled_since(baseline) {
            crate::info!(
                "[{}] all enumerators cycled at {}ms - advancing",
                label,
                elapsed.as_millis()
            );
            return PollOutcome::AllCycled;
        }

        if Instant::now() >= next_poll {
            next_poll += policy.interval;
            seq += 1;
            match take_snapshot(globals) {
                Ok(document) => {
                    let counts = snapshot::count_devices(&document);
                    persist_snapshot(&document, label, seq);
                    report_snapshot(ctx, transport, &document, counts);

                    let (cycled, total) = ctx.cycle_status_since(baseline);
                    crate::info!(
                        "[{}] {}s: {}, {} events, {}/{} enumerators cycled",
                        label,
                        elapsed.as_secs(),
                        counts,
                        ctx.feed.event_count(),
                        cycled,
                        total
                    );

                    if elapsed >= policy.min_run
                        && !targets.is_empty()
                        && snapshot::is_target_identified(&document, targets)
                    {
                        crate::info!(
                            "[{}] target addresses identified at {}s - exiting early",
                            label,
                            elapsed.as_secs()
                        );
                        return PollOutcome::TargetsIdentified;
                    }
                }
                Err(e) => crate::warn!("[{}] snapshot unavailable: {}", label, e),
            }
        }

        if elapsed > policy.budget {
            crate::info!(
                "[{}] budget exhausted after {}s - proceeding with partial results",
                label,
                elapsed.as_secs()
            );
            return PollOutcome::TimedOut;
        }

        std::thread::sleep(policy.step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::BrowseSink;
    use crate::host::{HostObject, OnlineNotifyEvents, Value};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    const IDENTIFIED_DOC: &str = r#"<address type="String" value="10.0.0.5">
        <device classname="LogixController" name="1756-L85E"/></address>"#;

    const EMPTY_DOC: &str = "<topology/>";

    fn context() -> Arc<OrchestratorContext> {
        OrchestratorContext::new(Arc::new(AtomicBool::new(false)))
    }

    fn globals_with(doc: &'static str) -> ObjRef {
        HostObject::builder("globals")
            .slot(0x6001_0000, move |_| Ok(Value::Str(doc.into())))
            .build()
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(30),
            budget: Duration::from_millis(600),
            min_run: Duration::from_millis(10),
            step: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_all_cycled_early_exit() {
        let ctx = context();
        let sink = BrowseSink::new("x", ctx.feed.clone());
        sink.browse_cycled(None);
        ctx.track_enumerator(HostObject::builder("enum").build(), sink);

        let start = Instant::now();
        let outcome = poll_phase(
            &ctx,
            &globals_with(EMPTY_DOC),
            None,
            &[],
            0,
            fast_policy(),
            "test",
        );
        assert_eq!(outcome, PollOutcome::AllCycled);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_targets_identified_early_exit() {
        let ctx = context();
        // A tracked sink that never cycles keeps the cycle exit closed.
        let sink = BrowseSink::new("x", ctx.feed.clone());
        ctx.track_enumerator(HostObject::builder("enum").build(), sink);

        let outcome = poll_phase(
            &ctx,
            &globals_with(IDENTIFIED_DOC),
            None,
            &["10.0.0.5".to_string()],
            0,
            fast_policy(),
            "test",
        );
        assert_eq!(outcome, PollOutcome::TargetsIdentified);
        // The snapshot pass also harvested the device's address.
        assert_eq!(
            ctx.devices.get("1756-L85E").unwrap().address.as_deref(),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn test_timeout_proceeds() {
        let ctx = context();
        let sink = BrowseSink::new("x", ctx.feed.clone());
        ctx.track_enumerator(HostObject::builder("enum").build(), sink);

        let outcome = poll_phase(
            &ctx,
            &globals_with(EMPTY_DOC),
            None,
            &["10.0.0.5".to_string()],
            0,
            fast_policy(),
            "test",
        );
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[test]
    fn test_stop_flag_wins_immediately() {
        let ctx = context();
        ctx.stop.store(true, Ordering::Relaxed);
        let start = Instant::now();
        let outcome = poll_phase(
            &ctx,
            &globals_with(EMPTY_DOC),
            None,
            &[],
            0,
            fast_policy(),
            "test",
        );
        assert_eq!(outcome, PollOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_faulting_snapshot_source_times_out_gracefully() {
        let ctx = context();
        let sink = BrowseSink::new("x", ctx.feed.clone());
        ctx.track_enumerator(HostObject::builder("enum").build(), sink);
        let globals = HostObject::builder("globals")
            .slot(0x6001_0000, |_| panic!("dump crashed"))
            .build();

        let outcome = poll_phase(&ctx, &globals, None, &[], 0, fast_policy(), "test");
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[test]
    fn test_min_run_defers_cycle_exit() {
        let ctx = context();
        let sink = BrowseSink::new("x", ctx.feed.clone());
        sink.browse_cycled(None);
        ctx.track_enumerator(HostObject::builder("enum").build(), sink);

        let policy = PollPolicy {
            min_run: Duration::from_millis(200),
            ..fast_policy()
        };
        let start = Instant::now();
        let outcome = poll_phase(&ctx, &globals_with(EMPTY_DOC), None, &[], 0, policy, "test");
        assert_eq!(outcome, PollOutcome::AllCycled);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
