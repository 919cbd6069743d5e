// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted opaque host objects.
//!
//! An [`ObjRef`] is this crate's handle to one object living in the host's
//! world: a label for diagnostics, an erased slot table, and zero or more
//! connection points. Cloning an `ObjRef` takes a reference; dropping the
//! last clone releases it. The embedding layer (loader or test fixture)
//! builds the objects and wires their slot entries to whatever actually
//! backs them - from this crate's side every entry is an unverified
//! function pointer and is only ever invoked through
//! [`tagged_call`](super::tagged_call).

use super::capability::CapabilityId;
use super::connection::ConnectionPoint;
use super::slots::CallError;
use super::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub(super) type SlotHandler = Box<dyn Fn(&[Value]) -> Result<Value, CallError> + Send + Sync>;

/// One object in the host's graph.
pub struct HostObject {
    label: String,
    slots: HashMap<u32, SlotHandler>,
    points: Vec<Arc<ConnectionPoint>>,
}

impl HostObject {
    /// Start building an object with the given diagnostic label.
    pub fn builder(label: impl Into<String>) -> HostObjectBuilder {
        HostObjectBuilder {
            label: label.into(),
            slots: HashMap::new(),
            points: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(super) fn slot(&self, index: u32) -> Option<&SlotHandler> {
        self.slots.get(&index)
    }

    /// All connection points this object exposes, in declaration order.
    pub fn connection_points(&self) -> &[Arc<ConnectionPoint>] {
        &self.points
    }

    /// The connection point for one specific capability, if any.
    pub fn find_connection_point(&self, id: &CapabilityId) -> Option<Arc<ConnectionPoint>> {
        self.points
            .iter()
            .find(|cp| cp.capability() == *id)
            .cloned()
    }
}

/// Shared handle to a [`HostObject`].
#[derive(Clone)]
pub struct ObjRef(Arc<HostObject>);

impl ObjRef {
    pub fn label(&self) -> &str {
        self.0.label()
    }

    pub fn connection_points(&self) -> &[Arc<ConnectionPoint>] {
        self.0.connection_points()
    }

    pub fn find_connection_point(&self, id: &CapabilityId) -> Option<Arc<ConnectionPoint>> {
        self.0.find_connection_point(id)
    }

    pub(super) fn slot(&self, index: u32) -> Option<&SlotHandler> {
        self.0.slot(index)
    }

    /// Object identity - two refs to the same underlying host object.
    ///
    /// Used to deduplicate captured bus references; the host may report the
    /// same bus from several events.
    pub fn same_object(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.label())
    }
}

/// Builder used by the embedding layer to assemble host objects.
pub struct HostObjectBuilder {
    label: String,
    slots: HashMap<u32, SlotHandler>,
    points: Vec<Arc<ConnectionPoint>>,
}

impl HostObjectBuilder {
    /// Install a handler at a numeric slot.
    pub fn slot<F>(mut self, index: u32, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.slots.insert(index, Box::new(handler));
        self
    }

    /// Attach a connection point. The caller keeps the returned-by-`new`
    /// `Arc` if it needs to deliver events through the point later.
    pub fn connection_point(mut self, point: Arc<ConnectionPoint>) -> Self {
        self.points.push(point);
        self
    }

    pub fn build(self) -> ObjRef {
        ObjRef(Arc::new(HostObject {
            label: self.label,
            slots: self.slots,
            points: self.points,
        }))
    }
}
