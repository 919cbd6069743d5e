// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The host's single-threaded message loop, as this crate sees it.
//!
//! Host objects are bound to one pre-existing thread that spends its life
//! retrieving messages from a queue. The embedding layer hands the
//! orchestrator a [`LoopHandle`] to that loop; the affinity dispatcher
//! reaches the thread through exactly two doors:
//!
//! - a transient **get-message hook**, observing every posted message as the
//!   loop retrieves it, plus [`LoopHandle::post`] to queue a wake message
//! - a **window** owned by the loop thread, whose procedure can be swapped
//!   and driven synchronously with [`LoopHandle::send_sync`]
//!
//! Sent messages go straight to the window procedure and are not seen by
//! get-message hooks; that mirrors the host platform and is why the
//! dispatcher's two strategies do not interfere with each other.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::Instant;

/// Message code for the dispatcher's wake message (a deliberately inert
/// code the host itself never acts on).
pub const MSG_WAKE: u32 = 0;

/// Magic marker carried by the wake message so the hook ignores the host's
/// own traffic.
pub const WAKE_MAGIC: u64 = 0x70_70_5C4E_C0DE;

/// Private message code recognized by the subclass fallback procedure.
pub const SUBCLASS_MSG: u32 = 0x8001;

/// One queued or sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub param: u64,
}

/// Identifier of a window owned by a loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowId(u64);

/// Identifier of an installed get-message hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Errors from loop interactions.
#[derive(Debug)]
pub enum LoopError {
    /// The loop's queue is gone (thread exited).
    Terminated,
    /// The loop refuses low-level hooks.
    HookDenied,
    /// No window with that id on this loop.
    NoSuchWindow,
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated => write!(f, "message loop terminated"),
            Self::HookDenied => write!(f, "loop refused hook installation"),
            Self::NoSuchWindow => write!(f, "no such window on loop thread"),
        }
    }
}

impl std::error::Error for LoopError {}

type HookFn = Arc<dyn Fn(&Message) + Send + Sync>;

/// A window procedure: invoked on the loop thread per delivered message.
pub type WindowProc = Arc<dyn Fn(&Message) -> u64 + Send + Sync>;

enum QueueItem {
    Posted(Message),
    Sent {
        window: WindowId,
        message: Message,
        reply: Arc<SyncReply>,
    },
    Quit,
}

struct SyncReply {
    slot: Mutex<Option<u64>>,
    ready: Condvar,
}

struct WindowEntry {
    id: WindowId,
    proc_: Mutex<WindowProc>,
}

struct LoopShared {
    tx: Sender<QueueItem>,
    hooks: Mutex<Vec<(HookId, HookFn)>>,
    next_hook: AtomicU64,
    deny_hooks: AtomicBool,
    windows: Mutex<Vec<WindowEntry>>,
    next_window: AtomicU64,
    thread: OnceLock<ThreadId>,
    created_at: Instant,
}

/// Cloneable handle to a message loop, usable from any thread.
#[derive(Clone)]
pub struct LoopHandle(Arc<LoopShared>);

/// The loop itself; [`run`](MessageLoop::run) consumes it on the thread
/// that owns the host's objects.
pub struct MessageLoop {
    shared: Arc<LoopShared>,
    rx: Receiver<QueueItem>,
}

impl MessageLoop {
    pub fn new() -> (Self, LoopHandle) {
        let (tx, rx) = unbounded();
        let shared = Arc::new(LoopShared {
            tx,
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            deny_hooks: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
            next_window: AtomicU64::new(1),
            thread: OnceLock::new(),
            created_at: Instant::now(),
        });
        (
            Self {
                shared: shared.clone(),
                rx,
            },
            LoopHandle(shared),
        )
    }

    /// Run the loop on the current thread until [`LoopHandle::quit`].
    ///
    /// Posted messages pass through every installed hook at retrieval time;
    /// sent messages go straight to the addressed window's procedure and
    /// unblock the sender with the procedure's return value.
    pub fn run(self) {
        let _ = self.shared.thread.set(std::thread::current().id());

        while let Ok(item) = self.rx.recv() {
            match item {
                QueueItem::Posted(msg) => {
                    let hooks: Vec<HookFn> = self
                        .shared
                        .hooks
                        .lock()
                        .iter()
                        .map(|(_, f)| f.clone())
                        .collect();
                    for hook in hooks {
                        let result = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| hook(&msg)),
                        );
                        if result.is_err() {
                            crate::warn!("[loop] get-message hook panicked (isolated)");
                        }
                    }
                }
                QueueItem::Sent {
                    window,
                    message,
                    reply,
                } => {
                    let proc_ = self
                        .shared
                        .windows
                        .lock()
                        .iter()
                        .find(|w| w.id == window)
                        .map(|w| w.proc_.lock().clone());

                    let value = match proc_ {
                        Some(proc_) => std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| proc_(&message)),
                        )
                        .unwrap_or_else(|_| {
                            crate::warn!("[loop] window procedure panicked (isolated)");
                            0
                        }),
                        None => 0,
                    };

                    *reply.slot.lock() = Some(value);
                    reply.ready.notify_all();
                }
                QueueItem::Quit => break,
            }
        }
    }
}

impl LoopHandle {
    /// Thread the loop runs on; `None` until `run()` starts.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.0.thread.get().copied()
    }

    /// Creation time, used by the oldest-loop heuristic.
    pub fn created_at(&self) -> Instant {
        self.0.created_at
    }

    /// Queue a message for retrieval by the loop thread.
    pub fn post(&self, message: Message) -> Result<(), LoopError> {
        self.0
            .tx
            .send(QueueItem::Posted(message))
            .map_err(|_| LoopError::Terminated)
    }

    /// Install a get-message hook observing posted messages.
    pub fn install_hook<F>(&self, hook: F) -> Result<HookId, LoopError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if self.0.deny_hooks.load(Ordering::Relaxed) {
            return Err(LoopError::HookDenied);
        }
        let id = HookId(self.0.next_hook.fetch_add(1, Ordering::Relaxed));
        self.0.hooks.lock().push((id, Arc::new(hook)));
        Ok(id)
    }

    /// Remove a previously installed hook. Unknown ids are ignored.
    pub fn remove_hook(&self, id: HookId) {
        self.0.hooks.lock().retain(|(h, _)| *h != id);
    }

    /// Make the loop refuse future hook installs (the host platform can).
    pub fn set_deny_hooks(&self, deny: bool) {
        self.0.deny_hooks.store(deny, Ordering::Relaxed);
    }

    /// Create a window owned by this loop with the given procedure.
    pub fn create_window<F>(&self, proc_: F) -> WindowId
    where
        F: Fn(&Message) -> u64 + Send + Sync + 'static,
    {
        let id = WindowId(self.0.next_window.fetch_add(1, Ordering::Relaxed));
        self.0.windows.lock().push(WindowEntry {
            id,
            proc_: Mutex::new(Arc::new(proc_)),
        });
        id
    }

    /// First window owned by the loop thread, if any.
    pub fn first_window(&self) -> Option<WindowId> {
        self.0.windows.lock().first().map(|w| w.id)
    }

    /// Current procedure of a window.
    pub fn window_proc(&self, id: WindowId) -> Result<WindowProc, LoopError> {
        self.0
            .windows
            .lock()
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.proc_.lock().clone())
            .ok_or(LoopError::NoSuchWindow)
    }

    /// Swap a window's procedure, returning the previous one.
    pub fn set_window_proc(
        &self,
        id: WindowId,
        proc_: WindowProc,
    ) -> Result<WindowProc, LoopError> {
        let windows = self.0.windows.lock();
        let entry = windows
            .iter()
            .find(|w| w.id == id)
            .ok_or(LoopError::NoSuchWindow)?;
        let mut slot = entry.proc_.lock();
        Ok(std::mem::replace(&mut *slot, proc_))
    }

    /// Synchronously drive a window's procedure on the loop thread.
    ///
    /// Blocks, with no timeout, until the loop thread has processed the
    /// message; returns the procedure's value. Get-message hooks do not see
    /// sent messages.
    pub fn send_sync(&self, window: WindowId, message: Message) -> Result<u64, LoopError> {
        let reply = Arc::new(SyncReply {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        self.0
            .tx
            .send(QueueItem::Sent {
                window,
                message,
                reply: reply.clone(),
            })
            .map_err(|_| LoopError::Terminated)?;

        let mut slot = reply.slot.lock();
        while slot.is_none() {
            reply.ready.wait(&mut slot);
        }
        Ok(slot.take().unwrap_or(0))
    }

    /// Ask the loop thread to exit.
    pub fn quit(&self) {
        let _ = self.0.tx.send(QueueItem::Quit);
    }

    fn downgrade(&self) -> Weak<LoopShared> {
        Arc::downgrade(&self.0)
    }
}

/// Process-wide table of known message loops.
///
/// The dispatcher consults it when no loop was pinned explicitly: the
/// oldest *running* loop is taken as the host's primary thread. That is a
/// heuristic, not an identification; it matches how the host arranges its
/// threads in practice.
pub struct LoopRegistry {
    loops: Mutex<Vec<Weak<LoopShared>>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self {
            loops: Mutex::new(Vec::new()),
        }
    }

    /// The shared process-wide registry the embedding layer registers into.
    pub fn global() -> &'static LoopRegistry {
        static GLOBAL: OnceLock<LoopRegistry> = OnceLock::new();
        GLOBAL.get_or_init(LoopRegistry::new)
    }

    pub fn register(&self, handle: &LoopHandle) {
        self.loops.lock().push(handle.downgrade());
    }

    /// Oldest registered loop that is actually running, if any.
    pub fn oldest_running(&self) -> Option<LoopHandle> {
        let mut loops = self.loops.lock();
        loops.retain(|w| w.strong_count() > 0);
        loops
            .iter()
            .filter_map(|w| w.upgrade().map(LoopHandle))
            .filter(|h| h.thread_id().is_some())
            .min_by_key(|h| h.created_at())
    }
}

impl Default for LoopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
        let (lp, handle) = MessageLoop::new();
        let joiner = thread::spawn(move || lp.run());
        // Wait until the loop records its thread id.
        while handle.thread_id().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        (handle, joiner)
    }

    #[test]
    fn test_hook_sees_posted_messages() {
        let (handle, joiner) = spawn_loop();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();

        let hook = handle
            .install_hook(move |msg| {
                if msg.code == MSG_WAKE && msg.param == WAKE_MAGIC {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        handle
            .post(Message {
                code: MSG_WAKE,
                param: WAKE_MAGIC,
            })
            .unwrap();
        handle
            .post(Message {
                code: MSG_WAKE,
                param: 0,
            })
            .unwrap();

        let t0 = Instant::now();
        while seen.load(Ordering::SeqCst) == 0 && t0.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        handle.remove_hook(hook);
        handle.quit();
        joiner.join().unwrap();
    }

    #[test]
    fn test_hook_denied() {
        let (handle, joiner) = spawn_loop();
        handle.set_deny_hooks(true);
        assert!(matches!(
            handle.install_hook(|_| {}),
            Err(LoopError::HookDenied)
        ));
        handle.quit();
        joiner.join().unwrap();
    }

    #[test]
    fn test_send_sync_runs_on_loop_thread() {
        let (handle, joiner) = spawn_loop();
        let loop_tid = handle.thread_id().unwrap();

        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        let window = handle.create_window(move |msg| {
            *observed2.lock() = Some((std::thread::current().id(), *msg));
            7
        });

        let value = handle
            .send_sync(
                window,
                Message {
                    code: SUBCLASS_MSG,
                    param: 3,
                },
            )
            .unwrap();
        assert_eq!(value, 7);

        let (tid, msg) = observed.lock().take().unwrap();
        assert_eq!(tid, loop_tid);
        assert_eq!(msg.param, 3);

        handle.quit();
        joiner.join().unwrap();
    }

    #[test]
    fn test_sent_messages_bypass_hooks() {
        let (handle, joiner) = spawn_loop();
        let hook_hits = Arc::new(AtomicUsize::new(0));
        let hook_hits2 = hook_hits.clone();
        handle.install_hook(move |_| {
            hook_hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let window = handle.create_window(|_| 0);
        handle
            .send_sync(
                window,
                Message {
                    code: SUBCLASS_MSG,
                    param: 0,
                },
            )
            .unwrap();

        assert_eq!(hook_hits.load(Ordering::SeqCst), 0);
        handle.quit();
        joiner.join().unwrap();
    }

    #[test]
    fn test_window_proc_swap_and_restore() {
        let (handle, joiner) = spawn_loop();
        let window = handle.create_window(|_| 1);

        let original = handle.window_proc(window).unwrap();
        let orig_clone = original.clone();
        let replacement: WindowProc = Arc::new(move |msg: &Message| {
            if msg.code == SUBCLASS_MSG {
                99
            } else {
                orig_clone(msg)
            }
        });

        let swapped_out = handle.set_window_proc(window, replacement).unwrap();
        assert!(Arc::ptr_eq(&swapped_out, &original));

        let value = handle
            .send_sync(
                window,
                Message {
                    code: SUBCLASS_MSG,
                    param: 0,
                },
            )
            .unwrap();
        assert_eq!(value, 99);

        // Delegation for other codes still reaches the original.
        let value = handle
            .send_sync(window, Message { code: 5, param: 0 })
            .unwrap();
        assert_eq!(value, 1);

        handle.set_window_proc(window, swapped_out).unwrap();
        handle.quit();
        joiner.join().unwrap();
    }

    #[test]
    fn test_registry_oldest_running() {
        let registry = LoopRegistry::new();
        assert!(registry.oldest_running().is_none());

        let (first, j1) = spawn_loop();
        thread::sleep(Duration::from_millis(5));
        let (second, j2) = spawn_loop();

        // Register out of order; creation time decides.
        registry.register(&second);
        registry.register(&first);

        let oldest = registry.oldest_running().unwrap();
        assert_eq!(oldest.thread_id(), first.thread_id());

        first.quit();
        second.quit();
        j1.join().unwrap();
        j2.join().unwrap();
    }

    #[test]
    fn test_registry_skips_unstarted_loops() {
        let registry = LoopRegistry::new();
        let (_lp, handle) = MessageLoop::new();
        registry.register(&handle);
        // Never ran - no thread id, not eligible.
        assert!(registry.oldest_running().is_none());
    }

    #[test]
    fn test_post_after_quit() {
        let (handle, joiner) = spawn_loop();
        handle.quit();
        joiner.join().unwrap();
        // A dead loop reports Terminated instead of hanging.
        assert!(matches!(
            handle.post(Message {
                code: MSG_WAKE,
                param: 0,
            }),
            Err(LoopError::Terminated)
        ));
    }
}
