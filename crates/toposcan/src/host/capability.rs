// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notification capability sets and subscription negotiation.
//!
//! A notification source asks a prospective subscriber which capability
//! surface it speaks before delivering events through it. Two surfaces are
//! known: the enumerator-side notify set ([`OnlineNotifyEvents`]) and the
//! bus-side event set ([`BusEvents`]). They are delivered by different
//! source objects but carry the same handful of semantic events.

use super::object::ObjRef;
use super::value::Address;
use std::fmt;
use std::sync::Arc;

/// Opaque 128-bit capability identity (recovered from the host, not
/// interpreted).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId(pub [u8; 16]);

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{{{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Enumerator-side notification capability.
pub const CAP_ONLINE_NOTIFY: CapabilityId = CapabilityId([
    0x8f, 0x1c, 0x42, 0x7b, 0x5d, 0x68, 0x11, 0xcf, 0xb4, 0xb9, 0xc4, 0x6f, 0x03, 0xc1, 0x00,
    0x01,
]);

/// Bus-side event capability.
pub const CAP_BUS_EVENTS: CapabilityId = CapabilityId([
    0x8f, 0x1c, 0x42, 0x7b, 0x5d, 0x68, 0x11, 0xcf, 0xb4, 0xb9, 0xc4, 0x6f, 0x03, 0xc1, 0x00,
    0x02,
]);

/// Events delivered by an enumeration operation.
///
/// Callbacks arrive on the host's message-loop thread at any time after the
/// subscription is established. Implementations must be `Send + Sync` and
/// must not block.
pub trait OnlineNotifyEvents: Send + Sync {
    /// One enumeration pass has begun.
    fn browse_started(&self, source: Option<&ObjRef>);

    /// Explicit signal that one full pass over the address space finished.
    fn browse_cycled(&self, source: Option<&ObjRef>);

    /// The enumeration stopped for good.
    fn browse_ended(&self, source: Option<&ObjRef>);

    /// Something answered at `addr`.
    fn address_found(&self, source: Option<&ObjRef>, addr: &Address);

    /// Nothing answered at `addr`.
    fn address_not_found(&self, source: Option<&ObjRef>, addr: &Address);
}

/// Events delivered by a bus object.
///
/// The browse events mirror [`OnlineNotifyEvents`] under different entry
/// points; the port events exist on the wire but carry nothing the
/// discovery path needs, so they default to no-ops.
pub trait BusEvents: Send + Sync {
    /// A port appeared on the bus.
    fn on_port_connect(&self, _source: Option<&ObjRef>) {}

    /// A port left the bus.
    fn on_port_disconnect(&self, _source: Option<&ObjRef>) {}

    /// A port changed address or state.
    fn on_port_changed(&self, _source: Option<&ObjRef>) {}

    /// One enumeration pass has begun on this bus.
    fn on_browse_started(&self, source: Option<&ObjRef>);

    /// Explicit full-pass signal.
    fn on_browse_cycled(&self, source: Option<&ObjRef>);

    /// The browse stopped for good.
    fn on_browse_ended(&self, source: Option<&ObjRef>);

    /// Something answered at `addr`.
    fn on_address_found(&self, source: Option<&ObjRef>, addr: &Address);

    /// Nothing answered at `addr`.
    fn on_address_not_found(&self, source: Option<&ObjRef>, addr: &Address);
}

/// The dispatch surface a subscriber hands back during negotiation.
#[derive(Clone)]
pub enum SinkDispatch {
    /// The subscriber will take events through [`OnlineNotifyEvents`].
    Notify(Arc<dyn OnlineNotifyEvents>),
    /// The subscriber will take events through [`BusEvents`].
    Bus(Arc<dyn BusEvents>),
}

/// Capability negotiation entry point implemented by event subscribers.
pub trait EventSink: Send + Sync {
    /// Answer a source's capability query.
    ///
    /// Returning `None` refuses the subscription. See the collector for the
    /// accept-all policy this system actually ships.
    fn query_capability(&self, id: &CapabilityId) -> Option<SinkDispatch>;
}
