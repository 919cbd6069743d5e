// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection points: the host's publish/subscribe attachment points.
//!
//! A source object exposes one connection point per capability it can
//! deliver. Subscribers are advised in and handed a cookie; they must be
//! unadvised before the source object is released - a dangling subscription
//! on a released source is undefined behavior in the host, which is why the
//! orchestrator's cleanup unadvises everything before dropping its object
//! references.

use super::capability::{CapabilityId, EventSink, SinkDispatch};
use super::object::ObjRef;
use super::slots::CallError;
use super::value::Address;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One notification channel on a source object.
pub struct ConnectionPoint {
    capability: CapabilityId,
    subscribers: Mutex<Vec<(u32, SinkDispatch)>>,
    next_cookie: AtomicU32,
    // Test hosts flip this to simulate a source that refuses teardown;
    // cleanup must keep going regardless.
    fail_next_unadvise: AtomicBool,
}

impl ConnectionPoint {
    pub fn new(capability: CapabilityId) -> Arc<Self> {
        Arc::new(Self {
            capability,
            subscribers: Mutex::new(Vec::new()),
            next_cookie: AtomicU32::new(1),
            fail_next_unadvise: AtomicBool::new(false),
        })
    }

    pub fn capability(&self) -> CapabilityId {
        self.capability
    }

    /// Establish a subscription.
    ///
    /// The point queries the sink for a dispatch surface matching its
    /// capability; a sink that answers `None` has refused and the
    /// subscription is not established.
    pub fn advise(&self, sink: &Arc<dyn EventSink>) -> Result<u32, CallError> {
        let dispatch = sink
            .query_capability(&self.capability)
            .ok_or(CallError::Refused)?;
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((cookie, dispatch));
        Ok(cookie)
    }

    /// Tear down one subscription by cookie.
    pub fn unadvise(&self, cookie: u32) -> Result<(), CallError> {
        if self.fail_next_unadvise.swap(false, Ordering::Relaxed) {
            return Err(CallError::Fault);
        }
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(c, _)| *c != cookie);
        if subs.len() == before {
            return Err(CallError::Refused);
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Make the next `unadvise` fail (simulated teardown refusal).
    pub fn inject_unadvise_fault(&self) {
        self.fail_next_unadvise.store(true, Ordering::Relaxed);
    }

    /// Deliver "browse started" to every subscriber, on the caller's thread.
    pub fn emit_started(&self, source: Option<&ObjRef>) {
        self.deliver(|d| match d {
            SinkDispatch::Notify(n) => n.browse_started(source),
            SinkDispatch::Bus(b) => b.on_browse_started(source),
        });
    }

    /// Deliver the explicit full-pass signal.
    pub fn emit_cycled(&self, source: Option<&ObjRef>) {
        self.deliver(|d| match d {
            SinkDispatch::Notify(n) => n.browse_cycled(source),
            SinkDispatch::Bus(b) => b.on_browse_cycled(source),
        });
    }

    /// Deliver "browse ended".
    pub fn emit_ended(&self, source: Option<&ObjRef>) {
        self.deliver(|d| match d {
            SinkDispatch::Notify(n) => n.browse_ended(source),
            SinkDispatch::Bus(b) => b.on_browse_ended(source),
        });
    }

    /// Deliver "something answered at `addr`".
    pub fn emit_found(&self, source: Option<&ObjRef>, addr: &Address) {
        self.deliver(|d| match d {
            SinkDispatch::Notify(n) => n.address_found(source, addr),
            SinkDispatch::Bus(b) => b.on_address_found(source, addr),
        });
    }

    /// Deliver "nothing answered at `addr`".
    pub fn emit_not_found(&self, source: Option<&ObjRef>, addr: &Address) {
        self.deliver(|d| match d {
            SinkDispatch::Notify(n) => n.address_not_found(source, addr),
            SinkDispatch::Bus(b) => b.on_address_not_found(source, addr),
        });
    }

    /// Invoke `f` per subscriber with panic isolation.
    ///
    /// A panicking subscriber loses that one event; it does not poison the
    /// point or the delivering thread.
    fn deliver<F: Fn(&SinkDispatch)>(&self, f: F) {
        let subs = self.subscribers.lock().clone();
        for (_, dispatch) in &subs {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(dispatch)));
            if result.is_err() {
                crate::warn!("[cp {}] subscriber panicked during delivery", self.capability);
            }
        }
    }
}
