// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Browse phases: the bodies executed against the host's object graph.
//!
//! Everything here is a plain function over the context plus acquired
//! object references. Bus acquisition and target registration run directly
//! on the orchestrator's worker thread; the browse and cleanup bodies are
//! handed to the affinity dispatcher because starting and stopping
//! enumerations is only legal on the host's loop thread.
//!
//! Failure policy per the error taxonomy: a strategy failure falls through
//! to the next strategy; a per-device or per-driver failure skips that item
//! and keeps going; only "every driver failed" bubbles up as a phase
//! failure. Cleanup never gives up early - a refused stop or unadvise is
//! logged and the remaining handles still get their turn.

use super::context::OrchestratorContext;
use crate::collector::BrowseSink;
use crate::config::{DriverTarget, HookConfig};
use crate::host::{
    call_obj, call_str, call_unit, CallError, EventSink, ObjRef, SlotOp, Value, CAP_BUS_EVENTS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bus names the host is known to use for nested backplanes, tried in
/// order when a port will not reveal its bus directly.
const BACKPLANE_NAME_FALLBACKS: &[&str] = &["Backplane", "CompactBus", "PointBus", "Chassis", "BP"];

/// Retry schedule for bus acquisition.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            delay: Duration::from_secs(5),
        }
    }
}

/// One driver bound to its live bus object.
#[derive(Clone)]
pub struct BusBinding {
    pub driver: DriverTarget,
    pub bus: ObjRef,
}

/// Root services -> topology globals.
pub fn acquire_globals(root: &ObjRef) -> Result<ObjRef, CallError> {
    call_obj(root, SlotOp::GetTopologyGlobals, &[])
}

/// Topology globals -> this-workstation object.
pub fn acquire_workstation(globals: &ObjRef) -> Result<ObjRef, CallError> {
    call_obj(globals, SlotOp::GetWorkstation, &[])
}

/// Items of a host collection, skipping entries that fault.
fn collection_items(collection: &ObjRef) -> Vec<ObjRef> {
    let count = match crate::host::call_int(collection, SlotOp::ItemCount, &[]) {
        Ok(n) if n >= 0 => n,
        Ok(_) | Err(_) => 0,
    };
    let mut items = Vec::new();
    for index in 0..count {
        match call_obj(collection, SlotOp::ItemAt, &[Value::Int(index)]) {
            Ok(item) => items.push(item),
            Err(e) => crate::warn!("[collection] item {} unavailable: {}", index, e),
        }
    }
    items
}

/// Resolve one driver's bus object, walking the fixed strategy chain.
fn acquire_bus_once(root: &ObjRef, workstation: &ObjRef, name: &str) -> Option<ObjRef> {
    // Strategy 1: by-name lookup on the workstation.
    match call_obj(workstation, SlotOp::BusByName, &[Value::Str(name.into())]) {
        Ok(bus) => {
            crate::info!("[bus] '{}' resolved by name lookup", name);
            return Some(bus);
        }
        Err(e) => crate::info!("[bus] name lookup for '{}' failed: {}", name, e),
    }

    // Strategy 2: enumerate the workstation's bus collection.
    if let Ok(collection) = call_obj(workstation, SlotOp::BusCollection, &[]) {
        for item in collection_items(&collection) {
            let item_name = call_str(&item, SlotOp::ObjectName, &[]).unwrap_or_default();
            if item_name.eq_ignore_ascii_case(name) {
                crate::info!("[bus] '{}' resolved via bus collection", name);
                return Some(item);
            }
        }
        crate::info!("[bus] '{}' not present in bus collection", name);
    }

    // Strategy 3: bind by textual path on the root services object.
    match call_obj(root, SlotOp::BindToPath, &[Value::Str(name.into())]) {
        Ok(bus) => {
            crate::info!("[bus] '{}' resolved by path binding", name);
            return Some(bus);
        }
        Err(e) => crate::info!("[bus] path binding for '{}' failed: {}", name, e),
    }

    None
}

/// Last-resort creation: ask the workstation to create the port/bus pair.
///
/// The created object is either the bus itself or a port that knows its
/// bus; both shapes occur in the wild.
fn create_bus(workstation: &ObjRef, name: &str) -> Option<ObjRef> {
    let created = match call_obj(workstation, SlotOp::CreatePort, &[Value::Str(name.into())]) {
        Ok(obj) => obj,
        Err(e) => {
            crate::warn!("[bus] create-port for '{}' failed: {}", name, e);
            return None;
        }
    };
    match call_obj(&created, SlotOp::PortBus, &[]) {
        Ok(bus) => {
            crate::info!("[bus] '{}' created via port, bus obtained from it", name);
            Some(bus)
        }
        Err(_) => {
            crate::info!("[bus] '{}' created directly as a bus", name);
            Some(created)
        }
    }
}

/// Acquire a bus per driver, with bounded retries and one-shot creation.
///
/// Drivers whose chain never succeeds are skipped (and logged); the caller
/// decides whether an empty result is fatal.
pub fn acquire_buses(
    root: &ObjRef,
    workstation: &ObjRef,
    config: &HookConfig,
    stop: &AtomicBool,
    retry: RetryPolicy,
) -> Vec<BusBinding> {
    let mut bindings = Vec::new();

    for driver in &config.drivers {
        let mut bus = None;
        let mut creation_attempted = false;

        for attempt in 0..retry.attempts {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            bus = acquire_bus_once(root, workstation, &driver.name);
            if bus.is_some() {
                break;
            }

            // Creation is a one-shot per driver, tried after the lookup
            // strategies have failed once. New drivers go straight to it.
            if !creation_attempted && (driver.new_driver || attempt >= 1) {
                creation_attempted = true;
                bus = create_bus(workstation, &driver.name);
                if bus.is_some() {
                    break;
                }
            }

            if attempt + 1 < retry.attempts {
                crate::info!(
                    "[bus] '{}' not found (attempt {}/{}), retrying in {:?}",
                    driver.name,
                    attempt + 1,
                    retry.attempts,
                    retry.delay
                );
                std::thread::sleep(retry.delay);
            }
        }

        match bus {
            Some(bus) => {
                crate::info!("[bus] acquired '{}'", driver.name);
                bindings.push(BusBinding {
                    driver: driver.clone(),
                    bus,
                });
            }
            None => crate::error!(
                "[bus] could not get or create '{}' after {} attempts",
                driver.name,
                retry.attempts
            ),
        }
    }

    bindings
}

/// Outcome of the registration phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStats {
    pub added: usize,
    pub existing: usize,
    pub failed: usize,
}

/// Register every target address with its bus.
///
/// "Already exists" is success-with-no-op: registration is idempotent and
/// re-running a configuration must not turn into a failure report.
pub fn register_targets(bindings: &[BusBinding]) -> RegistrationStats {
    let mut stats = RegistrationStats::default();

    for binding in bindings {
        if binding.driver.addresses.is_empty() {
            crate::info!(
                "[register] '{}' has no addresses - using the host's own table",
                binding.driver.name
            );
            continue;
        }
        for address in &binding.driver.addresses {
            match call_unit(
                &binding.bus,
                SlotOp::AddTarget,
                &[Value::Str(address.clone())],
            ) {
                Ok(()) => {
                    crate::info!("[register] {} added on '{}'", address, binding.driver.name);
                    stats.added += 1;
                }
                Err(CallError::AlreadyExists) => {
                    crate::info!("[register] {} already present - skipping", address);
                    stats.existing += 1;
                }
                Err(e) => {
                    crate::warn!("[register] {} failed: {}", address, e);
                    stats.failed += 1;
                }
            }
        }
    }

    crate::info!(
        "[register] added {}, existing {}, failed {}",
        stats.added,
        stats.existing,
        stats.failed
    );
    stats
}

/// Advise `sink` on every connection point of `source`, recording each
/// subscription in the context.
///
/// Subscriptions are established *before* the enumeration is started -
/// events may begin the instant start returns, and early events must have
/// somewhere to land.
fn subscribe_all(ctx: &OrchestratorContext, source: &ObjRef, sink: &Arc<BrowseSink>) -> usize {
    let entry: Arc<dyn EventSink> = sink.clone();
    let mut connected = 0;
    for point in source.connection_points() {
        match point.advise(&entry) {
            Ok(cookie) => {
                ctx.track_subscription(point.clone(), cookie);
                connected += 1;
            }
            Err(e) => crate::warn!(
                "[subscribe] point {} on '{}' refused: {}",
                point.capability(),
                source.label(),
                e
            ),
        }
    }
    connected
}

/// Advise `sink` on one specific capability of `source`, if exposed.
fn subscribe_capability(
    ctx: &OrchestratorContext,
    source: &ObjRef,
    sink: &Arc<BrowseSink>,
) -> usize {
    let Some(point) = source.find_connection_point(&CAP_BUS_EVENTS) else {
        return 0;
    };
    let entry: Arc<dyn EventSink> = sink.clone();
    match point.advise(&entry) {
        Ok(cookie) => {
            ctx.track_subscription(point, cookie);
            1
        }
        Err(e) => {
            crate::warn!("[subscribe] bus events on '{}' refused: {}", source.label(), e);
            0
        }
    }
}

/// The enumerator for a source object: its own facet, or a standalone
/// instance from root services as the fallback.
fn obtain_enumerator(root: &ObjRef, source: &ObjRef) -> Result<ObjRef, CallError> {
    match call_obj(source, SlotOp::EnumeratorFacet, &[]) {
        Ok(enumerator) => Ok(enumerator),
        Err(first) => {
            crate::info!(
                "[enum] '{}' has no enumerator facet ({}), creating standalone",
                source.label(),
                first
            );
            call_obj(root, SlotOp::CreateEnumerator, &[])
        }
    }
}

/// Top-level browse: one enumeration per acquired bus.
///
/// Runs on the host's loop thread. Returns how many enumerations started.
pub fn primary_browse(
    ctx: &OrchestratorContext,
    root: &ObjRef,
    bindings: &[BusBinding],
) -> usize {
    let mut started = 0;

    for binding in bindings {
        let name = &binding.driver.name;
        crate::info!("[primary] === driver '{}' ===", name);

        let sink = BrowseSink::new(name.clone(), ctx.feed.clone());

        // Bus-side events first, then the enumerator's own channels.
        subscribe_capability(ctx, &binding.bus, &sink);

        let enumerator = match obtain_enumerator(root, &binding.bus) {
            Ok(enumerator) => enumerator,
            Err(e) => {
                crate::error!("[primary] no enumerator for '{}': {}", name, e);
                continue;
            }
        };
        let connected = subscribe_all(ctx, &enumerator, &sink);
        crate::info!("[primary] connected {} enumerator channels", connected);

        let path = match call_obj(&binding.bus, SlotOp::BrowsePath, &[]) {
            Ok(path) => path,
            Err(e) => {
                crate::error!("[primary] no browse path for '{}': {}", name, e);
                ctx.track_enumerator(enumerator, sink);
                continue;
            }
        };

        match call_unit(&enumerator, SlotOp::StartBrowse, &[Value::Obj(path)]) {
            Ok(()) => {
                crate::info!("[primary] browse started for '{}'", name);
                started += 1;
            }
            Err(e) => crate::warn!("[primary] start failed for '{}': {}", name, e),
        }
        ctx.track_enumerator(enumerator, sink);
    }

    crate::info!("[primary] {}/{} drivers started", started, bindings.len());
    started
}

/// Device-level browse: walk each bus's devices and start their backplane
/// enumerations. Runs on the host's loop thread.
pub fn bus_browse(ctx: &OrchestratorContext, bindings: &[BusBinding], probe: bool) -> usize {
    let mut started = 0;
    let mut backplanes = 0;

    for binding in bindings {
        crate::info!("[bus] === driver '{}' ===", binding.driver.name);
        let devices = match call_obj(&binding.bus, SlotOp::DeviceCollection, &[]) {
            Ok(collection) => collection_items(&collection),
            Err(e) => {
                crate::warn!("[bus] device collection unavailable: {}", e);
                continue;
            }
        };
        crate::info!("[bus] {} devices on '{}'", devices.len(), binding.driver.name);

        for device in devices {
            let name = call_str(&device, SlotOp::ObjectName, &[]).unwrap_or_default();
            let object_id = call_str(&device, SlotOp::ObjectId, &[]).unwrap_or_default();
            ctx.record_device(&name, &object_id);
            if probe {
                crate::info!("[bus] device '{}' object-id '{}'", name, object_id);
            }

            if call_obj(&device, SlotOp::BackplanePort, &[]).is_err() {
                crate::info!("[bus] '{}' has no backplane port", name);
                continue;
            }
            backplanes += 1;

            let enumerator = match call_obj(&device, SlotOp::EnumeratorFacet, &[]) {
                Ok(enumerator) => enumerator,
                Err(e) => {
                    crate::info!("[bus] '{}' has no enumerator facet: {}", name, e);
                    continue;
                }
            };
            let path = match call_obj(&device, SlotOp::BrowsePath, &[]) {
                Ok(path) => path,
                Err(e) => {
                    crate::info!("[bus] no browse path for '{}': {}", name, e);
                    continue;
                }
            };

            let sink = BrowseSink::new(name.clone(), ctx.feed.clone());
            let connected = subscribe_all(ctx, &enumerator, &sink);
            crate::info!("[bus] connected {} channels for '{}'", connected, name);

            match call_unit(&enumerator, SlotOp::StartBrowse, &[Value::Obj(path)]) {
                Ok(()) => {
                    crate::info!("[bus] backplane browse started for '{}'", name);
                    started += 1;
                }
                Err(e) => crate::warn!("[bus] start failed for '{}': {}", name, e),
            }
            ctx.track_enumerator(enumerator, sink);
        }
    }

    crate::info!("[bus] done: {} backplanes found, {} started", backplanes, started);
    started
}

/// Backplane-level browse: reach each device's nested bus and enumerate
/// its slots. Runs on the host's loop thread.
pub fn backplane_browse(ctx: &OrchestratorContext, bindings: &[BusBinding]) -> usize {
    let mut started = 0;

    for binding in bindings {
        crate::info!("[backplane] === driver '{}' ===", binding.driver.name);
        let devices = match call_obj(&binding.bus, SlotOp::DeviceCollection, &[]) {
            Ok(collection) => collection_items(&collection),
            Err(e) => {
                crate::warn!("[backplane] device collection unavailable: {}", e);
                continue;
            }
        };

        for device in devices {
            let name = call_str(&device, SlotOp::ObjectName, &[]).unwrap_or_default();

            let port = match call_obj(&device, SlotOp::BackplanePort, &[]) {
                Ok(port) => port,
                Err(_) => continue,
            };

            // The port usually knows its bus; some hosts only reveal the
            // nested bus by one of a handful of conventional names.
            let nested = match call_obj(&port, SlotOp::PortBus, &[]) {
                Ok(bus) => Some(bus),
                Err(e) => {
                    crate::info!(
                        "[backplane] port on '{}' would not give its bus ({}), trying names",
                        name,
                        e
                    );
                    BACKPLANE_NAME_FALLBACKS.iter().find_map(|candidate| {
                        call_obj(&device, SlotOp::BusByName, &[Value::Str((*candidate).into())])
                            .ok()
                    })
                }
            };
            let Some(nested) = nested else {
                crate::info!("[backplane] no nested bus for '{}'", name);
                continue;
            };

            let label = call_str(&nested, SlotOp::ObjectLabel, &[]).unwrap_or_default();
            let sink_label = if label.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", name, label)
            };

            let enumerator = match call_obj(&nested, SlotOp::EnumeratorFacet, &[]) {
                Ok(enumerator) => enumerator,
                Err(e) => {
                    crate::info!("[backplane] '{}' bus has no enumerator: {}", sink_label, e);
                    continue;
                }
            };
            let path = match call_obj(&nested, SlotOp::BrowsePath, &[]) {
                Ok(path) => path,
                Err(e) => {
                    crate::info!("[backplane] no browse path for '{}': {}", sink_label, e);
                    continue;
                }
            };

            let sink = BrowseSink::new(sink_label.clone(), ctx.feed.clone());
            subscribe_capability(ctx, &nested, &sink);

            match call_unit(&enumerator, SlotOp::StartBrowse, &[Value::Obj(path)]) {
                Ok(()) => {
                    crate::info!("[backplane] browse started for '{}'", sink_label);
                    started += 1;
                }
                Err(e) => crate::warn!("[backplane] start failed for '{}': {}", sink_label, e),
            }
            ctx.track_enumerator(enumerator, sink);
        }
    }

    crate::info!("[backplane] done: {} started", started);
    started
}

/// Outcome of the cleanup phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub enumerators_stopped: usize,
    pub stop_failures: usize,
    pub subscriptions_released: usize,
    pub unadvise_failures: usize,
}

/// Teardown: stop every enumerator, release every subscription, drop every
/// reference. Best-effort and non-transactional - one refusal never blocks
/// the rest. Runs on the host's loop thread.
pub fn run_cleanup(ctx: &OrchestratorContext) -> CleanupStats {
    let mut stats = CleanupStats::default();

    let handles = ctx.take_enumerators();
    crate::info!("[cleanup] stopping {} enumerators", handles.len());
    for handle in &handles {
        match call_unit(&handle.enumerator, SlotOp::StopBrowse, &[]) {
            Ok(()) => stats.enumerators_stopped += 1,
            Err(e) => {
                stats.stop_failures += 1;
                crate::warn!(
                    "[cleanup] stop refused by '{}' ({}), continuing",
                    handle.sink.label(),
                    e
                );
            }
        }
    }

    let subscriptions = ctx.take_subscriptions();
    crate::info!("[cleanup] releasing {} subscriptions", subscriptions.len());
    for subscription in &subscriptions {
        match subscription.point.unadvise(subscription.cookie) {
            Ok(()) => stats.subscriptions_released += 1,
            Err(e) => {
                stats.unadvise_failures += 1;
                crate::warn!("[cleanup] unadvise failed ({}), continuing", e);
            }
        }
    }

    // Sinks stay alive until here on purpose: the host may deliver late
    // events after stop, and they must land on live objects. Dropping the
    // handles now releases enumerators and sinks together, after
    // everything has been stopped and unadvised.
    drop(subscriptions);
    drop(handles);
    ctx.feed.clear_captured();

    crate::info!(
        "[cleanup] stopped {} (failures {}), released {} (failures {})",
        stats.enumerators_stopped,
        stats.stop_failures,
        stats.subscriptions_released,
        stats.unadvise_failures
    );
    stats
}
