// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-run orchestrator state: the live-handle registries.
//!
//! One [`OrchestratorContext`] exists per run and owns every resource the
//! phases acquire: enumerator handles, connection-point subscriptions, the
//! discovered-device table and the event feed. The registries are appended
//! to by browse phases (executing on the host's loop thread via the
//! dispatcher) and drained exactly once by cleanup; event callbacks never
//! touch them - they only write through their own sink and the feed.

use crate::collector::{BrowseSink, DiscoveryFeed};
use crate::host::{ConnectionPoint, ObjRef};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One live enumeration operation.
///
/// Must be stopped and released exactly once, even on failure paths; the
/// underlying host resource otherwise leaks for the life of the host
/// process. Ownership sits in the context registry and leaves it only
/// through cleanup's drain.
pub struct EnumeratorHandle {
    pub enumerator: ObjRef,
    pub sink: Arc<BrowseSink>,
}

/// One live event-channel subscription.
///
/// Must be unadvised before its source object is released; a dangling
/// subscription on a released source is undefined behavior in the host.
pub struct SubscriptionHandle {
    pub point: Arc<ConnectionPoint>,
    pub cookie: u32,
}

/// Detail sheet for one discovered device, superseded as snapshots arrive.
#[derive(Debug, Clone, Default)]
pub struct DeviceDetail {
    pub name: String,
    pub object_id: String,
    pub address: Option<String>,
}

/// State owned by one orchestrator run.
pub struct OrchestratorContext {
    pub stop: Arc<AtomicBool>,
    pub feed: Arc<DiscoveryFeed>,
    /// Keyed by display name; a later snapshot's entry replaces, not
    /// merges, the earlier one's address.
    pub devices: DashMap<String, DeviceDetail>,
    enumerators: Mutex<Vec<EnumeratorHandle>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl OrchestratorContext {
    pub fn new(stop: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            stop,
            feed: DiscoveryFeed::new(),
            devices: DashMap::new(),
            enumerators: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Register a started (or start-attempted) enumeration for teardown.
    pub fn track_enumerator(&self, enumerator: ObjRef, sink: Arc<BrowseSink>) {
        self.enumerators
            .lock()
            .push(EnumeratorHandle { enumerator, sink });
    }

    /// Register an established subscription for teardown.
    pub fn track_subscription(&self, point: Arc<ConnectionPoint>, cookie: u32) {
        self.subscriptions
            .lock()
            .push(SubscriptionHandle { point, cookie });
    }

    pub fn enumerator_count(&self) -> usize {
        self.enumerators.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Index marking where the *next* phase's handles will begin.
    ///
    /// Phase-scoped completion checks only look at handles past their
    /// baseline, never at earlier phases' enumerators.
    pub fn baseline(&self) -> usize {
        self.enumerators.lock().len()
    }

    /// Have all enumerators registered since `baseline` completed a cycle?
    ///
    /// Vacuously true when the phase registered nothing.
    pub fn cycled_since(&self, baseline: usize) -> bool {
        let enumerators = self.enumerators.lock();
        let scoped = &enumerators[baseline.min(enumerators.len())..];
        scoped.iter().all(|h| h.sink.cycle_complete())
    }

    /// `(completed, total)` cycle status for handles past `baseline`.
    pub fn cycle_status_since(&self, baseline: usize) -> (usize, usize) {
        let enumerators = self.enumerators.lock();
        let scoped = &enumerators[baseline.min(enumerators.len())..];
        let completed = scoped.iter().filter(|h| h.sink.cycle_complete()).count();
        (completed, scoped.len())
    }

    /// Record (or refresh) a device's identity as a browse phase meets it.
    pub fn record_device(&self, name: &str, object_id: &str) {
        if name.is_empty() {
            return;
        }
        let mut entry = self.devices.entry(name.to_string()).or_default();
        entry.name = name.to_string();
        entry.object_id = object_id.to_string();
    }

    /// Attach an address to a device from a snapshot; later snapshots
    /// supersede earlier ones.
    pub fn set_device_address(&self, name: &str, address: &str) {
        if name.is_empty() {
            return;
        }
        let mut entry = self.devices.entry(name.to_string()).or_default();
        entry.name = name.to_string();
        entry.address = Some(address.to_string());
    }

    /// Drain the enumerator registry for cleanup. Each handle leaves the
    /// registry exactly once.
    pub fn take_enumerators(&self) -> Vec<EnumeratorHandle> {
        std::mem::take(&mut *self.enumerators.lock())
    }

    /// Drain the subscription registry for cleanup.
    pub fn take_subscriptions(&self) -> Vec<SubscriptionHandle> {
        std::mem::take(&mut *self.subscriptions.lock())
    }
}
