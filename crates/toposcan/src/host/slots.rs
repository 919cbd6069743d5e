// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot-indexed dispatch with crash isolation.
//!
//! Every operation the orchestrator performs against a host object goes
//! through [`tagged_call`]: look the operation up in the pure-data
//! [`SLOT_TABLE`], check the arguments against the recorded signature, and
//! invoke the object's erased handler inside a panic guard. A crash behind
//! the slot boundary becomes [`CallError::Fault`], never a process abort.
//!
//! The slot numbers are empirical artifacts of the host binary. They are
//! data, not logic: nothing outside this table may mention a numeric slot.

use super::object::ObjRef;
use super::value::{Value, ValueKind};
use std::fmt;
use std::io;

/// Symbolic names for every host operation the discovery path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOp {
    /// Root services -> topology globals object.
    GetTopologyGlobals,
    /// Topology globals -> this-workstation device object.
    GetWorkstation,
    /// Named bus lookup on a device: `(name) -> bus`.
    BusByName,
    /// Workstation -> collection of all buses.
    BusCollection,
    /// Root services: bind an object by textual path: `(path) -> obj`.
    BindToPath,
    /// Workstation: create a port/bus pair by name: `(name) -> obj`.
    CreatePort,
    /// Collection -> number of items.
    ItemCount,
    /// Collection -> item at index: `(index) -> obj`.
    ItemAt,
    /// Bus -> collection of devices currently on it.
    DeviceCollection,
    /// Any object -> display name.
    ObjectName,
    /// Any object -> internal object id.
    ObjectId,
    /// Port/bus -> short label.
    ObjectLabel,
    /// Bus or device -> browse path object.
    BrowsePath,
    /// Bus or device -> its enumerator facet, if it has one.
    EnumeratorFacet,
    /// Root services -> a standalone enumerator instance.
    CreateEnumerator,
    /// Enumerator: begin browsing against a path object: `(path)`.
    StartBrowse,
    /// Enumerator: stop browsing.
    StopBrowse,
    /// Device -> its backplane port, if any.
    BackplanePort,
    /// Port -> the bus on its far side.
    PortBus,
    /// Bus: register a target address to probe: `(address)`.
    AddTarget,
    /// Topology globals -> full topology snapshot document.
    DumpTopology,
}

impl fmt::Display for SlotOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Recorded shape of one slot: index plus argument/return kinds.
pub struct SlotSpec {
    pub op: SlotOp,
    pub slot: u32,
    pub params: &'static [ValueKind],
    pub ret: ValueKind,
}

/// The empirical method-table map. Slot indices were recovered from the
/// host binary; several indices repeat because different object kinds
/// expose different tables.
pub const SLOT_TABLE: &[SlotSpec] = &[
    SlotSpec {
        op: SlotOp::ObjectName,
        slot: 1,
        params: &[],
        ret: ValueKind::Str,
    },
    SlotSpec {
        op: SlotOp::ObjectId,
        slot: 2,
        params: &[],
        ret: ValueKind::Str,
    },
    SlotSpec {
        op: SlotOp::BrowsePath,
        slot: 4,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::ObjectLabel,
        slot: 7,
        params: &[],
        ret: ValueKind::Str,
    },
    SlotSpec {
        op: SlotOp::StartBrowse,
        slot: 7,
        params: &[ValueKind::Obj],
        ret: ValueKind::Empty,
    },
    SlotSpec {
        op: SlotOp::StopBrowse,
        slot: 8,
        params: &[],
        ret: ValueKind::Empty,
    },
    SlotSpec {
        op: SlotOp::GetTopologyGlobals,
        slot: 9,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::PortBus,
        slot: 10,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::GetWorkstation,
        slot: 12,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::CreatePort,
        slot: 14,
        params: &[ValueKind::Str],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::BindToPath,
        slot: 16,
        params: &[ValueKind::Str],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::BackplanePort,
        slot: 19,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::EnumeratorFacet,
        slot: 21,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::CreateEnumerator,
        slot: 22,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::BusByName,
        slot: 38,
        params: &[ValueKind::Str],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::DeviceCollection,
        slot: 50,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::BusCollection,
        slot: 51,
        params: &[],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::AddTarget,
        slot: 54,
        params: &[ValueKind::Str],
        ret: ValueKind::Empty,
    },
    SlotSpec {
        op: SlotOp::ItemCount,
        slot: 1,
        params: &[],
        ret: ValueKind::Int,
    },
    SlotSpec {
        op: SlotOp::ItemAt,
        slot: 0,
        params: &[ValueKind::Int],
        ret: ValueKind::Obj,
    },
    SlotSpec {
        op: SlotOp::DumpTopology,
        slot: 0x6001_0000,
        params: &[],
        ret: ValueKind::Str,
    },
];

/// Errors produced at the slot-call boundary.
#[derive(Debug)]
pub enum CallError {
    /// The object does not provide this operation (next strategy, please).
    Missing(SlotOp),
    /// The host understood the call and said no.
    Refused,
    /// The target already exists; idempotent registration treats this as
    /// success-with-no-op.
    AlreadyExists,
    /// Arguments or return value did not match the recorded signature.
    Signature(SlotOp),
    /// The call crashed behind the isolation boundary.
    Fault,
    /// Host-side I/O failed while servicing the call.
    Io(io::Error),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(op) => write!(f, "object does not provide {}", op),
            Self::Refused => write!(f, "host refused the call"),
            Self::AlreadyExists => write!(f, "target already exists"),
            Self::Signature(op) => write!(f, "signature mismatch calling {}", op),
            Self::Fault => write!(f, "call faulted (isolated crash)"),
            Self::Io(e) => write!(f, "host I/O error: {}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<io::Error> for CallError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

fn spec_for(op: SlotOp) -> &'static SlotSpec {
    // The table is tiny and cold; a linear scan keeps it declarative.
    SLOT_TABLE
        .iter()
        .find(|spec| spec.op == op)
        .unwrap_or_else(|| unreachable!("SLOT_TABLE must cover every SlotOp"))
}

/// Invoke `op` on `obj` with crash isolation and signature checking.
pub fn tagged_call(obj: &ObjRef, op: SlotOp, args: &[Value]) -> Result<Value, CallError> {
    let spec = spec_for(op);

    if args.len() != spec.params.len()
        || args
            .iter()
            .zip(spec.params)
            .any(|(arg, kind)| arg.kind() != *kind)
    {
        return Err(CallError::Signature(op));
    }

    let handler = obj.slot(spec.slot).ok_or(CallError::Missing(op))?;

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(args)));
    match outcome {
        Ok(result) => {
            let value = result?;
            if value.kind() != spec.ret {
                return Err(CallError::Signature(op));
            }
            Ok(value)
        }
        Err(_) => {
            crate::warn!("[slot] {} on '{}' faulted (crash isolated)", op, obj.label());
            Err(CallError::Fault)
        }
    }
}

/// [`tagged_call`] for object-returning operations.
pub fn call_obj(obj: &ObjRef, op: SlotOp, args: &[Value]) -> Result<ObjRef, CallError> {
    tagged_call(obj, op, args)?
        .into_obj()
        .ok_or(CallError::Signature(op))
}

/// [`tagged_call`] for string-returning operations.
pub fn call_str(obj: &ObjRef, op: SlotOp, args: &[Value]) -> Result<String, CallError> {
    match tagged_call(obj, op, args)? {
        Value::Str(s) => Ok(s),
        _ => Err(CallError::Signature(op)),
    }
}

/// [`tagged_call`] for integer-returning operations.
pub fn call_int(obj: &ObjRef, op: SlotOp, args: &[Value]) -> Result<i32, CallError> {
    tagged_call(obj, op, args)?
        .as_int()
        .ok_or(CallError::Signature(op))
}

/// [`tagged_call`] for void operations.
pub fn call_unit(obj: &ObjRef, op: SlotOp, args: &[Value]) -> Result<(), CallError> {
    tagged_call(obj, op, args).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::object::HostObject;

    fn named_object(name: &str) -> ObjRef {
        let name = name.to_string();
        HostObject::builder("dev")
            .slot(1, move |_| Ok(Value::Str(name.clone())))
            .build()
    }

    #[test]
    fn test_table_covers_every_op() {
        // spec_for() panics on a gap; walk all variants through it.
        for spec in SLOT_TABLE {
            assert_eq!(spec_for(spec.op).op, spec.op);
        }
    }

    #[test]
    fn test_call_str_happy_path() {
        let obj = named_object("1756-L85E");
        assert_eq!(call_str(&obj, SlotOp::ObjectName, &[]).unwrap(), "1756-L85E");
    }

    #[test]
    fn test_missing_slot() {
        let obj = HostObject::builder("bare").build();
        assert!(matches!(
            call_str(&obj, SlotOp::ObjectName, &[]),
            Err(CallError::Missing(SlotOp::ObjectName))
        ));
    }

    #[test]
    fn test_signature_mismatch_on_args() {
        let obj = named_object("x");
        // ObjectName takes no arguments.
        assert!(matches!(
            tagged_call(&obj, SlotOp::ObjectName, &[Value::Int(1)]),
            Err(CallError::Signature(SlotOp::ObjectName))
        ));
    }

    #[test]
    fn test_signature_mismatch_on_return() {
        let obj = HostObject::builder("liar")
            .slot(1, |_| Ok(Value::Int(42)))
            .build();
        assert!(matches!(
            tagged_call(&obj, SlotOp::ObjectName, &[]),
            Err(CallError::Signature(SlotOp::ObjectName))
        ));
    }

    #[test]
    fn test_fault_is_isolated() {
        let obj = HostObject::builder("crashy")
            .slot(1, |_| panic!("wild pointer"))
            .build();
        assert!(matches!(
            call_str(&obj, SlotOp::ObjectName, &[]),
            Err(CallError::Fault)
        ));
        // The process (and this thread) survived; a second call still works
        // against a healthy object.
        let ok = named_object("alive");
        assert!(call_str(&ok, SlotOp::ObjectName, &[]).is_ok());
    }

    #[test]
    fn test_handler_error_passes_through() {
        let obj = HostObject::builder("dup")
            .slot(54, |_| Err(CallError::AlreadyExists))
            .build();
        assert!(matches!(
            call_unit(&obj, SlotOp::AddTarget, &[Value::Str("10.0.0.5".into())]),
            Err(CallError::AlreadyExists)
        ));
    }
}
