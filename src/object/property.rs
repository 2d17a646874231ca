//! Property list nodes and property descriptors.
//!
//! An object's properties form a singly-linked list of pool-allocated nodes.
//! A node is either a named data property, a named accessor property, or an
//! internal slot (engine bookkeeping such as [[Class]], invisible to user
//! code). Descriptors are the partial specifications handed to
//! [[DefineOwnProperty]] (ES5 8.10).

use crate::mem::{CompressedPtr, Reset};
use crate::object::ObjectId;
use crate::strings::StringId;
use crate::value::Value;

/// Handle to a property node in the property pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropId(pub CompressedPtr);

impl PropId {
    pub fn from_raw(raw: u16) -> Option<Self> {
        CompressedPtr::pack(raw).map(PropId)
    }

    pub fn raw(self) -> u16 {
        self.0.unpack()
    }
}

/// Engine-internal per-object slots. The payload is a bare u32 whose meaning
/// depends on the tag (magic string id, pool handle, opcode counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalSlot {
    /// [[Class]]: magic string id of the class name.
    Class,
    /// [[PrimitiveValue]] of wrapper objects: handle of a value cell.
    PrimitiveValue,
    /// [[Scope]] of a function: object handle of the captured environment.
    Scope,
    /// Formal parameter list of a function: handle into the params pool.
    FormalParams,
    /// First opcode of a function body.
    CodePosition,
    /// Built-in routine id for native dispatch.
    BuiltinId,
    /// Non-zero when the function body is strict code.
    StrictCode,
}

/// A property node's payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Data {
        value: Value,
        writable: bool,
        enumerable: bool,
        configurable: bool,
        /// Set while an LCache line points at this node.
        lcached: bool,
    },
    Accessor {
        get: Option<ObjectId>,
        set: Option<ObjectId>,
        enumerable: bool,
        configurable: bool,
    },
    Internal {
        slot: InternalSlot,
        payload: u32,
    },
}

/// One node of an object's property list.
#[derive(Debug, Clone)]
pub struct PropertyNode {
    /// `None` for internal slots; named properties always carry a name.
    pub name: Option<StringId>,
    pub kind: PropertyKind,
    pub next: Option<PropId>,
}

impl PropertyNode {
    pub fn is_enumerable(&self) -> bool {
        match &self.kind {
            PropertyKind::Data { enumerable, .. } => *enumerable,
            PropertyKind::Accessor { enumerable, .. } => *enumerable,
            PropertyKind::Internal { .. } => false,
        }
    }

    pub fn is_configurable(&self) -> bool {
        match &self.kind {
            PropertyKind::Data { configurable, .. } => *configurable,
            PropertyKind::Accessor { configurable, .. } => *configurable,
            PropertyKind::Internal { .. } => false,
        }
    }
}

impl Default for PropertyNode {
    fn default() -> Self {
        PropertyNode {
            name: None,
            kind: PropertyKind::Internal {
                slot: InternalSlot::Class,
                payload: 0,
            },
            next: None,
        }
    }
}

impl Reset for PropertyNode {
    fn reset(&mut self) {
        *self = PropertyNode::default();
    }
}

/// Partial property specification for [[DefineOwnProperty]] (ES5 8.10).
///
/// Each field is independently present or absent; kind classification
/// follows 8.10.1-8.10.3.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyDescriptor {
    pub value: Option<Value>,
    pub writable: Option<bool>,
    pub get: Option<Option<ObjectId>>,
    pub set: Option<Option<ObjectId>>,
    pub enumerable: Option<bool>,
    pub configurable: Option<bool>,
}

impl PropertyDescriptor {
    pub fn is_data_descriptor(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }

    pub fn is_accessor_descriptor(&self) -> bool {
        self.get.is_some() || self.set.is_some()
    }

    pub fn is_generic_descriptor(&self) -> bool {
        !self.is_data_descriptor() && !self.is_accessor_descriptor()
    }

    /// The descriptor used by plain assignment: {value, all attributes true}.
    pub fn data(value: Value) -> Self {
        PropertyDescriptor {
            value: Some(value),
            writable: Some(true),
            enumerable: Some(true),
            configurable: Some(true),
            ..PropertyDescriptor::default()
        }
    }

    /// Only the value field, used by [[Put]] step 3 on an existing data
    /// property.
    pub fn value_only(value: Value) -> Self {
        PropertyDescriptor {
            value: Some(value),
            ..PropertyDescriptor::default()
        }
    }
}
