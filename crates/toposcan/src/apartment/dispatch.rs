// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Affinity dispatcher: run a closure on the host's loop thread.
//!
//! Most host objects may only be invoked from the thread that owns them.
//! [`AffinityDispatcher::execute`] gives the orchestrator a synchronous
//! RPC-shaped way to honor that: the request is injected into the target
//! thread's message loop, the caller blocks on a shared result slot, and
//! the work's outcome comes back as if it had been a local call.
//!
//! Two injection strategies, in fixed priority order:
//!
//! 1. **Hook + wake**: install a transient get-message hook on the target
//!    loop, post a wake message carrying [`WAKE_MAGIC`], and poll the result
//!    slot (100 ms steps, 30 s budget, stop-flag aware). The hook is
//!    uninstalled whatever happens.
//! 2. **Window subclass**: if the hook cannot be installed or the wait
//!    timed out, find any window owned by the target thread, swap its
//!    procedure for one that recognizes [`SUBCLASS_MSG`], drive it with a
//!    synchronous send (which blocks until the target thread has processed
//!    it, so this path needs no timeout), then restore the original
//!    procedure.
//!
//! The request-pending flag is claimed with compare-and-swap on the target
//! thread, so even if both strategies end up armed the work runs exactly
//! once. One dispatcher allows one request in flight; a second `execute`
//! while one is pending is refused rather than queued.

use super::message_loop::{
    HookId, LoopError, LoopHandle, LoopRegistry, Message, MSG_WAKE, SUBCLASS_MSG, WAKE_MAGIC,
};
use crate::host::CallError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Budget for the hook + wake strategy.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result-slot poll interval (also the stop-flag latency bound).
pub const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// Work unit executed on the target thread.
pub type AffineWork = Box<dyn FnOnce() -> Result<(), CallError> + Send>;

/// Errors surfaced by [`AffinityDispatcher::execute`].
#[derive(Debug)]
pub enum DispatchError {
    /// No running loop could be located (or the located loop died).
    TargetNotFound,
    /// The target loop is the calling thread; self-affinity is a
    /// programming error, reported rather than deadlocked on.
    SelfAffinity,
    /// Another request is already in flight on this dispatcher.
    Busy,
    /// Hook strategy timed out and no window exists for the fallback.
    NoWindow,
    /// The stop flag was raised while waiting.
    Stopped,
    /// Both strategies were exhausted without the work running.
    NotDelivered,
    /// The work ran and failed.
    Failed(CallError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetNotFound => write!(f, "target loop thread not found"),
            Self::SelfAffinity => write!(f, "target loop is the calling thread"),
            Self::Busy => write!(f, "a dispatched request is already in flight"),
            Self::NoWindow => write!(f, "no window available for subclass fallback"),
            Self::Stopped => write!(f, "stopped while waiting for dispatch"),
            Self::NotDelivered => write!(f, "work was never picked up by the target thread"),
            Self::Failed(e) => write!(f, "dispatched work failed: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Per-request shared state: the pending flag the target thread claims and
/// the slot the caller polls.
struct RequestState {
    requested: AtomicBool,
    work: Mutex<Option<AffineWork>>,
    result: Mutex<Option<Result<(), CallError>>>,
    done: AtomicBool,
}

impl RequestState {
    fn new(work: AffineWork) -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(true),
            work: Mutex::new(Some(work)),
            result: Mutex::new(None),
            done: AtomicBool::new(false),
        })
    }

    /// Claim and run the work. Safe to reach from both strategies: the
    /// compare-and-swap guarantees a single execution.
    fn try_run(&self) {
        if self
            .requested
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let work = self.work.lock().take();
        let result = match work {
            Some(work) => work(),
            None => Err(CallError::Refused),
        };
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::Release);
    }

    fn take_result(&self) -> Option<Result<(), CallError>> {
        self.result.lock().take()
    }
}

/// Executes closures on the host's loop thread.
pub struct AffinityDispatcher {
    pinned: Mutex<Option<LoopHandle>>,
    registry: &'static LoopRegistry,
    stop: Arc<AtomicBool>,
    in_flight: AtomicBool,
}

impl AffinityDispatcher {
    /// Dispatcher that resolves its target from the given registry on first
    /// use (oldest running loop) and caches it.
    pub fn new(registry: &'static LoopRegistry, stop: Arc<AtomicBool>) -> Self {
        Self {
            pinned: Mutex::new(None),
            registry,
            stop,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Dispatcher pinned to one loop (the embedding layer knows the host's
    /// thread explicitly).
    pub fn with_target(target: LoopHandle, stop: Arc<AtomicBool>) -> Self {
        Self {
            pinned: Mutex::new(Some(target)),
            registry: LoopRegistry::global(),
            stop,
            in_flight: AtomicBool::new(false),
        }
    }

    fn resolve_target(&self) -> Result<LoopHandle, DispatchError> {
        let mut pinned = self.pinned.lock();
        if let Some(handle) = pinned.as_ref() {
            return Ok(handle.clone());
        }
        let found = self
            .registry
            .oldest_running()
            .ok_or(DispatchError::TargetNotFound)?;
        *pinned = Some(found.clone());
        Ok(found)
    }

    /// Run `work` on the target thread, blocking until it completes or the
    /// strategies are exhausted.
    pub fn execute(&self, work: AffineWork) -> Result<(), DispatchError> {
        self.execute_inner(work, true)
    }

    /// Like [`execute`](Self::execute), but the wait ignores the stop
    /// flag. Teardown uses this: cancellation interrupts the phases before
    /// cleanup, never cleanup itself.
    pub fn execute_ignoring_stop(&self, work: AffineWork) -> Result<(), DispatchError> {
        self.execute_inner(work, false)
    }

    fn execute_inner(&self, work: AffineWork, honor_stop: bool) -> Result<(), DispatchError> {
        let target = self.resolve_target()?;

        let target_tid = target.thread_id().ok_or(DispatchError::TargetNotFound)?;
        if target_tid == std::thread::current().id() {
            return Err(DispatchError::SelfAffinity);
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::Busy);
        }
        let _guard = FlightGuard(&self.in_flight);

        let state = RequestState::new(work);

        // --- Strategy 1: get-message hook + posted wake ---
        match self.install_wake_hook(&target, &state) {
            Ok(hook) => {
                let posted = target
                    .post(Message {
                        code: MSG_WAKE,
                        param: WAKE_MAGIC,
                    })
                    .is_ok();

                let wait = if posted {
                    self.wait_for_result(&state, honor_stop)
                } else {
                    crate::warn!("[dispatch] wake post failed, trying subclass fallback");
                    WaitOutcome::Pending
                };

                // Uninstall regardless of outcome.
                target.remove_hook(hook);

                match wait {
                    WaitOutcome::Done => {
                        return finish(&state);
                    }
                    WaitOutcome::Stopped => return Err(DispatchError::Stopped),
                    WaitOutcome::Pending => {
                        if posted {
                            crate::warn!(
                                "[dispatch] hook strategy timed out after {:?}, trying subclass fallback",
                                DISPATCH_TIMEOUT
                            );
                        }
                    }
                }
            }
            Err(LoopError::HookDenied) => {
                crate::info!("[dispatch] hook refused, trying subclass fallback");
            }
            Err(_) => return Err(DispatchError::TargetNotFound),
        }

        // --- Strategy 2: window subclass + synchronous send ---
        let window = target.first_window().ok_or(DispatchError::NoWindow)?;
        let original = target
            .window_proc(window)
            .map_err(|_| DispatchError::NoWindow)?;

        let state2 = state.clone();
        let delegate = original.clone();
        let subclass: Arc<dyn Fn(&Message) -> u64 + Send + Sync> = Arc::new(move |msg| {
            if msg.code == SUBCLASS_MSG {
                state2.try_run();
                0
            } else {
                delegate(msg)
            }
        });

        target
            .set_window_proc(window, subclass)
            .map_err(|_| DispatchError::NoWindow)?;

        let sent = target.send_sync(
            window,
            Message {
                code: SUBCLASS_MSG,
                param: 0,
            },
        );

        // Restore before anything else; the swapped procedure must not
        // outlive the call.
        let _ = target.set_window_proc(window, original);

        if sent.is_err() {
            return Err(DispatchError::TargetNotFound);
        }
        finish(&state)
    }

    fn install_wake_hook(
        &self,
        target: &LoopHandle,
        state: &Arc<RequestState>,
    ) -> Result<HookId, LoopError> {
        let state = state.clone();
        target.install_hook(move |msg| {
            if msg.code == MSG_WAKE && msg.param == WAKE_MAGIC {
                state.try_run();
            }
        })
    }

    fn wait_for_result(&self, state: &RequestState, honor_stop: bool) -> WaitOutcome {
        let start = Instant::now();
        loop {
            if state.done.load(Ordering::Acquire) {
                return WaitOutcome::Done;
            }
            if honor_stop && self.stop.load(Ordering::Relaxed) {
                return WaitOutcome::Stopped;
            }
            if start.elapsed() > DISPATCH_TIMEOUT {
                return WaitOutcome::Pending;
            }
            std::thread::sleep(DISPATCH_POLL);
        }
    }
}

enum WaitOutcome {
    Done,
    Stopped,
    Pending,
}

fn finish(state: &RequestState) -> Result<(), DispatchError> {
    match state.take_result() {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(DispatchError::Failed(e)),
        None => Err(DispatchError::NotDelivered),
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
