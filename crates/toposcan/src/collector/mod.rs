// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event collection: the sink subscribed to every enumeration.
//!
//! One [`BrowseSink`] is attached per enumeration operation. It implements
//! both notification capability sets the host delivers through
//! ([`OnlineNotifyEvents`] and [`BusEvents`]) and folds them into the same
//! five semantic events: started, cycled, ended, found, not-found.
//!
//! Completion is inferred, not returned: starting an enumeration gives no
//! synchronous "finished" signal, so the orchestrator polls each sink's
//! `cycle_complete` flag. The flag is set by an explicit cycled/ended
//! notification, or heuristically when an address repeats - the source has
//! looped back to the start of its address space. The heuristic can
//! under-count (a source that never loops) or over-count (a source that
//! revisits mid-pass); it is a tunable judgment call, not an invariant, and
//! the polling phases treat it accordingly (bounded budgets, proceed on
//! timeout).

use crate::host::{
    Address, BusEvents, CapabilityId, EventSink, ObjRef, OnlineNotifyEvents, SinkDispatch,
    CAP_BUS_EVENTS, CAP_ONLINE_NOTIFY,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Discovery-wide state the sinks feed: the running event tally and the
/// captured backplane buses.
///
/// Written from the host's loop thread (event delivery), read from the
/// orchestrator's worker thread.
pub struct DiscoveryFeed {
    event_count: AtomicUsize,
    capturing: AtomicBool,
    captured: Mutex<Vec<ObjRef>>,
}

impl DiscoveryFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            event_count: AtomicUsize::new(0),
            capturing: AtomicBool::new(false),
            captured: Mutex::new(Vec::new()),
        })
    }

    /// Total found-events across all sinks since startup.
    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }

    fn record_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Enable or disable bus capture (the backplane phase's discovery aid).
    pub fn set_capturing(&self, on: bool) {
        self.capturing.store(on, Ordering::Relaxed);
    }

    fn capture_bus(&self, bus: &ObjRef) {
        if !self.capturing.load(Ordering::Relaxed) {
            return;
        }
        let mut captured = self.captured.lock();
        if captured.iter().any(|b| b.same_object(bus)) {
            return;
        }
        crate::info!(
            "[capture] bus object '{}' captured (#{})",
            bus.label(),
            captured.len() + 1
        );
        captured.push(bus.clone());
    }

    pub fn captured_count(&self) -> usize {
        self.captured.lock().len()
    }

    /// Drain the captured bus references.
    pub fn take_captured(&self) -> Vec<ObjRef> {
        std::mem::take(&mut *self.captured.lock())
    }

    pub fn clear_captured(&self) {
        self.captured.lock().clear();
    }
}

/// Callback sink for one enumeration operation.
pub struct BrowseSink {
    label: String,
    found_count: AtomicU32,
    seen: Mutex<HashSet<String>>,
    cycle_complete: AtomicBool,
    browse_ended: AtomicBool,
    feed: Arc<DiscoveryFeed>,
    self_ref: Weak<BrowseSink>,
}

impl BrowseSink {
    pub fn new(label: impl Into<String>, feed: Arc<DiscoveryFeed>) -> Arc<Self> {
        let label = label.into();
        Arc::new_cyclic(|self_ref| Self {
            label,
            found_count: AtomicU32::new(0),
            seen: Mutex::new(HashSet::new()),
            cycle_complete: AtomicBool::new(false),
            browse_ended: AtomicBool::new(false),
            feed,
            self_ref: self_ref.clone(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Has this enumeration finished (or appeared to finish) one full pass?
    pub fn cycle_complete(&self) -> bool {
        self.cycle_complete.load(Ordering::Acquire)
    }

    /// Did the source report the browse as ended for good?
    pub fn browse_ended(&self) -> bool {
        self.browse_ended.load(Ordering::Acquire)
    }

    /// Total found-events this sink has taken, repeats included.
    pub fn found_count(&self) -> u32 {
        self.found_count.load(Ordering::Relaxed)
    }

    /// Number of distinct addresses seen.
    pub fn distinct_addresses(&self) -> usize {
        self.seen.lock().len()
    }

    fn record_started(&self, source: Option<&ObjRef>) {
        crate::info!("[enum:{}] browse started", self.label);
        if let Some(bus) = source {
            self.feed.capture_bus(bus);
        }
    }

    fn record_cycled(&self) {
        self.cycle_complete.store(true, Ordering::Release);
        crate::info!("[enum:{}] cycle signalled explicitly", self.label);
    }

    fn record_ended(&self) {
        self.cycle_complete.store(true, Ordering::Release);
        self.browse_ended.store(true, Ordering::Release);
        crate::info!(
            "[enum:{}] browse ended ({} addresses seen)",
            self.label,
            self.found_count()
        );
    }

    fn record_found(&self, addr: &Address) {
        let key = addr.to_string();
        if addr.is_slot() {
            crate::info!("[enum:{}] slot {} found", self.label, key);
        } else {
            crate::info!("[enum:{}] address {} found", self.label, key);
        }

        let count = self.found_count.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut seen = self.seen.lock();
            if !seen.insert(key.clone()) && !self.cycle_complete.swap(true, Ordering::AcqRel) {
                crate::info!(
                    "[enum:{}] cycle complete - repeat address {} (after {} events)",
                    self.label,
                    key,
                    count
                );
            }
        }
        self.feed.record_event();
    }

    fn record_not_found(&self, addr: &Address) {
        crate::debug!("[enum:{}] nothing at {}", self.label, addr);
    }
}

impl OnlineNotifyEvents for BrowseSink {
    fn browse_started(&self, source: Option<&ObjRef>) {
        self.record_started(source);
    }
    fn browse_cycled(&self, _source: Option<&ObjRef>) {
        self.record_cycled();
    }
    fn browse_ended(&self, _source: Option<&ObjRef>) {
        self.record_ended();
    }
    fn address_found(&self, _source: Option<&ObjRef>, addr: &Address) {
        self.record_found(addr);
    }
    fn address_not_found(&self, _source: Option<&ObjRef>, addr: &Address) {
        self.record_not_found(addr);
    }
}

impl BusEvents for BrowseSink {
    fn on_browse_started(&self, source: Option<&ObjRef>) {
        self.record_started(source);
    }
    fn on_browse_cycled(&self, _source: Option<&ObjRef>) {
        self.record_cycled();
    }
    fn on_browse_ended(&self, _source: Option<&ObjRef>) {
        self.record_ended();
    }
    fn on_address_found(&self, _source: Option<&ObjRef>, addr: &Address) {
        self.record_found(addr);
    }
    fn on_address_not_found(&self, _source: Option<&ObjRef>, addr: &Address) {
        self.record_not_found(addr);
    }
}

impl EventSink for BrowseSink {
    fn query_capability(&self, id: &CapabilityId) -> Option<SinkDispatch> {
        let me = self.self_ref.upgrade()?;
        if *id == CAP_BUS_EVENTS {
            return Some(SinkDispatch::Bus(me));
        }
        if *id == CAP_ONLINE_NOTIFY {
            return Some(SinkDispatch::Notify(me));
        }
        // Accept every unknown capability with the notify surface. The
        // host's sources carry more channel identities than were ever
        // recovered, and refusing a query breaks subscription
        // establishment outright; answering with the primary surface keeps
        // those channels connected at the cost of trusting the source to
        // deliver notify-shaped events through it.
        crate::debug!(
            "[enum:{}] unknown capability {} - answering with notify surface",
            self.label,
            id
        );
        Some(SinkDispatch::Notify(me))
    }
}
