// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tagged argument/return union for slot calls.
//!
//! The host ABI passes everything as a type-tagged union. Only the four
//! shapes the discovery path actually touches are modeled; anything else the
//! host might hand back is a signature error at the call boundary.

use super::object::ObjRef;
use std::fmt;

/// One slot-call argument or return value.
#[derive(Clone)]
pub enum Value {
    /// No value (void returns, omitted optional arguments).
    Empty,
    /// 32-bit signed integer (counts, indices, slot numbers).
    Int(i32),
    /// Text (names, addresses, snapshot documents).
    Str(String),
    /// Reference to another host object.
    Obj(ObjRef),
}

/// The tag of a [`Value`], used in slot signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Empty,
    Int,
    Str,
    Obj,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Empty => ValueKind::Empty,
            Self::Int(_) => ValueKind::Int,
            Self::Str(_) => ValueKind::Str,
            Self::Obj(_) => ValueKind::Obj,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Self::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn into_obj(self) -> Option<ObjRef> {
        match self {
            Self::Obj(obj) => Some(obj),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Int(n) => write!(f, "Int({})", n),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::Obj(obj) => write!(f, "Obj({})", obj.label()),
        }
    }
}

/// A probe/target address as the host reports it.
///
/// Top-level buses address devices by text (e.g. an IP string); nested
/// backplane buses address modules by integer slot number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// String-form address (network buses).
    Text(String),
    /// Integer-slot-form address (backplane buses).
    Slot(i32),
}

impl Address {
    /// Interpret an event payload value as an address.
    ///
    /// Integers become slot addresses, text becomes string addresses;
    /// anything else is unusable and reported as `None` so the caller can
    /// log and drop the event rather than invent an address.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(n) => Some(Self::Slot(*n)),
            Value::Str(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn is_slot(&self) -> bool {
        matches!(self, Self::Slot(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s),
            Self::Slot(n) => write!(f, "{}", n),
        }
    }
}
