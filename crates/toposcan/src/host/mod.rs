// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed boundary to the host's foreign object model.
//!
//! The host application exposes its device topology through a
//! reference-counted object graph whose method tables are only empirically
//! known: operations are reached by slot index, arguments travel as a tagged
//! union, and events come back through connection-point subscriptions. This
//! module models that boundary:
//!
//! - [`Value`] / [`Address`] - the tagged argument/return union
//! - [`ObjRef`] / [`HostObject`] - a refcounted opaque object with an erased
//!   slot table
//! - [`tagged_call`] - slot dispatch behind a crash-isolation boundary (a
//!   call through an unverified entry may panic; the guard converts that
//!   into an error result instead of taking the process down)
//! - [`ConnectionPoint`] - publish/subscribe attachment points with
//!   advise/unadvise cookies
//! - [`CapabilityId`] and the event capability traits the collector
//!   implements
//!
//! Slot numbers and capability identities are opaque constants recovered by
//! inspection of the live host; they live in one pure-data table
//! ([`slots::SLOT_TABLE`]) rather than being scattered through phase logic.

mod capability;
mod connection;
mod object;
mod slots;
mod value;

pub use capability::{
    BusEvents, CapabilityId, EventSink, OnlineNotifyEvents, SinkDispatch, CAP_BUS_EVENTS,
    CAP_ONLINE_NOTIFY,
};
pub use connection::ConnectionPoint;
pub use object::{HostObject, HostObjectBuilder, ObjRef};
pub use slots::{
    call_int, call_obj, call_str, call_unit, tagged_call, CallError, SlotOp, SlotSpec, SLOT_TABLE,
};
pub use value::{Address, Value, ValueKind};
