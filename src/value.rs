//! ECMAScript value representation: the tagged value, completion values and
//! references.
//!
//! Values are passed by copy. Non-primitive values carry ownership through
//! the refcounts on the pointee (string descriptors, object records); the
//! interpreter's copy/free discipline in `context.rs` keeps those counts
//! honest.

use crate::error::EngineError;
use crate::object::ObjectId;
use crate::strings::StringId;

/// A tagged ECMAScript value.
///
/// `Empty` is the internal sentinel for uninitialised immutable bindings; it
/// is never observable from user code. Numbers are stored inline: the enum
/// already spans two words, so the constrained-target number cell collapses
/// into the value itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(StringId),
    Object(ObjectId),
    Empty,
}

impl Value {
    #[inline]
    pub fn is_undefined(self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_nullish(self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        matches!(self, Value::Empty)
    }

    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(self) -> Option<StringId> {
        match self {
            Value::Str(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(id),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

/// Simple (non-heap) values as encoded in assignment opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SimpleValue {
    Undefined = 0,
    Null = 1,
    False = 2,
    True = 3,
}

impl SimpleValue {
    pub fn decode(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SimpleValue::Undefined),
            1 => Some(SimpleValue::Null),
            2 => Some(SimpleValue::False),
            3 => Some(SimpleValue::True),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            SimpleValue::Undefined => Value::Undefined,
            SimpleValue::Null => Value::Null,
            SimpleValue::False => Value::Bool(false),
            SimpleValue::True => Value::Bool(true),
        }
    }
}

/// The envelope every opcode handler returns.
///
/// The dispatch loop keeps running on `Empty`, translates `Meta` into
/// `Empty` and stops, and unwinds on everything else. `Normal` completions
/// with a value never reach the loop: value-producing operations use
/// [`OpResult`] internally and store into registers.
#[derive(Debug, Clone, Copy)]
pub enum Completion {
    /// Normal, no value. The loop continues.
    Empty,
    /// A structural marker opcode was reached; the enclosing construct
    /// consumes it. The loop stops without advancing.
    Meta,
    Return(Value),
    Throw(Value),
    /// Script requested termination with a success flag.
    Exit(bool),
    /// Engine fault; unwinds everything.
    Fatal(FatalKind),
}

/// Fatal faults as they travel through completions. Converted into
/// [`EngineError`] at the API boundary, where the message context lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    OutOfMemory,
    InvalidImage(&'static str),
}

impl FatalKind {
    pub fn into_engine_error(self) -> EngineError {
        match self {
            FatalKind::OutOfMemory => EngineError::OutOfMemory,
            FatalKind::InvalidImage(what) => EngineError::invalid_image(what),
        }
    }
}

/// Abrupt result of an internal ECMA operation.
///
/// `?` on an [`OpResult`] gives the scoped try/finalize shape every handler
/// needs: the first abrupt outcome aborts the enclosing handler, and
/// ownership (Drop plus the explicit free discipline) releases partial
/// results on every exit path.
#[derive(Debug, Clone, Copy)]
pub enum Abrupt {
    Throw(Value),
    Exit(bool),
    Fatal(FatalKind),
}

/// Result of an internal ECMA operation: a value or an abrupt completion.
pub type OpResult<T> = Result<T, Abrupt>;

impl From<Abrupt> for Completion {
    fn from(abrupt: Abrupt) -> Completion {
        match abrupt {
            Abrupt::Throw(v) => Completion::Throw(v),
            Abrupt::Exit(ok) => Completion::Exit(ok),
            Abrupt::Fatal(kind) => Completion::Fatal(kind),
        }
    }
}

impl Completion {
    /// Collapse an empty-or-abrupt operation result.
    pub fn from_result(result: OpResult<()>) -> Completion {
        match result {
            Ok(()) => Completion::Empty,
            Err(abrupt) => abrupt.into(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Completion::Empty)
    }
}

/// Base of a resolved reference.
#[derive(Debug, Clone, Copy)]
pub enum ReferenceBase {
    /// Property reference: primitive or object base value.
    Value(Value),
    /// Identifier resolved to a lexical environment.
    Env(ObjectId),
    /// Identifier that resolved nowhere; `get_value` turns this into a
    /// ReferenceError, `put_value` into a global define (non-strict).
    Unresolved,
}

/// A (base, referenced-name, strict) triple, per ES5 8.7.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
    pub base: ReferenceBase,
    pub name: StringId,
    pub strict: bool,
}

impl Reference {
    pub fn new(base: ReferenceBase, name: StringId, strict: bool) -> Self {
        Reference { base, name, strict }
    }
}
