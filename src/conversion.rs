//! ECMA conversions (ES5 §9): ToPrimitive, ToBoolean, ToNumber, ToString,
//! ToObject, CheckObjectCoercible, SameValue, the integer clampings and
//! ToPropertyDescriptor.
//!
//! Conversions that can invoke user code (via [[DefaultValue]]) or allocate
//! return `OpResult`; the rest are plain functions.

use crate::context::{Context, ErrorKind};
use crate::object::{InternalSlot, ObjectId, ObjectKind, ObjectType, PropertyDescriptor};
use crate::strings::{string_to_number, MagicStringId, StringId};
use crate::value::{OpResult, Value};

/// Preferred-type hint of ToPrimitive / [[DefaultValue]].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredType {
    None,
    String,
    Number,
}

impl Context {
    /// CheckObjectCoercible (ES5 9.10): undefined and null throw TypeError.
    pub fn check_object_coercible(&mut self, value: Value) -> OpResult<()> {
        if value.is_nullish() {
            Err(self.throw_error(ErrorKind::Type))
        } else {
            Ok(())
        }
    }

    /// SameValue (ES5 9.12). Handles NaN and distinguishes the zero signs,
    /// which float equality does not.
    pub fn same_value(&self, x: Value, y: Value) -> bool {
        match (x, y) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    true
                } else if a == 0.0 && b == 0.0 {
                    a.is_sign_negative() == b.is_sign_negative()
                } else {
                    a == b
                }
            }
            (Value::Str(a), Value::Str(b)) => self.strings.eq(a, b),
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Empty, Value::Empty) => true,
            _ => false,
        }
    }

    /// ToPrimitive (ES5 9.1). Objects go through [[DefaultValue]]; anything
    /// else copies. Returns an owned value.
    pub fn to_primitive(&mut self, value: Value, hint: PreferredType) -> OpResult<Value> {
        match value {
            Value::Object(obj) => self.op_object_default_value(obj, hint),
            other => {
                self.ref_value(other);
                Ok(other)
            }
        }
    }

    /// ToBoolean (ES5 9.2). Never throws, never allocates.
    pub fn to_boolean(&self, value: Value) -> bool {
        match value {
            Value::Undefined | Value::Null | Value::Empty => false,
            Value::Bool(b) => b,
            Value::Number(n) => !(n.is_nan() || n == 0.0),
            Value::Str(id) => !self.strings.text(id).is_empty(),
            Value::Object(_) => true,
        }
    }

    /// ToNumber (ES5 9.3).
    pub fn to_number(&mut self, value: Value) -> OpResult<f64> {
        match value {
            Value::Number(n) => Ok(n),
            Value::Str(id) => Ok(string_to_number(self.strings.text(id))),
            Value::Undefined => Ok(f64::NAN),
            Value::Null => Ok(0.0),
            Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            Value::Object(_) => {
                let primitive = self.to_primitive(value, PreferredType::Number)?;
                let result = self.to_number(primitive);
                self.free_value(primitive);
                result
            }
            Value::Empty => Err(crate::value::Abrupt::Fatal(
                crate::value::FatalKind::InvalidImage("ToNumber on the empty sentinel"),
            )),
        }
    }

    /// ToString (ES5 9.8). Returns an owned string reference.
    pub fn to_string_value(&mut self, value: Value) -> OpResult<StringId> {
        match value {
            Value::Str(id) => {
                self.strings.ref_string(id);
                Ok(id)
            }
            Value::Number(n) => self.with_string_recovery(n),
            Value::Undefined => Ok(self.strings.magic(MagicStringId::Undefined)),
            Value::Null => Ok(self.strings.magic(MagicStringId::Null)),
            Value::Bool(true) => Ok(self.strings.magic(MagicStringId::True)),
            Value::Bool(false) => Ok(self.strings.magic(MagicStringId::False)),
            Value::Object(_) => {
                let primitive = self.to_primitive(value, PreferredType::String)?;
                let result = self.to_string_value(primitive);
                self.free_value(primitive);
                result
            }
            Value::Empty => Err(crate::value::Abrupt::Fatal(
                crate::value::FatalKind::InvalidImage("ToString on the empty sentinel"),
            )),
        }
    }

    fn with_string_recovery(&mut self, n: f64) -> OpResult<StringId> {
        if let Some(id) = self.strings.from_number(n) {
            return Ok(id);
        }
        self.try_give_memory_back(crate::mem::GcSeverity::Low);
        if let Some(id) = self.strings.from_number(n) {
            return Ok(id);
        }
        self.try_give_memory_back(crate::mem::GcSeverity::Critical);
        self.strings
            .from_number(n)
            .ok_or(crate::value::Abrupt::Fatal(crate::value::FatalKind::OutOfMemory))
    }

    /// ToObject (ES5 9.9): primitives wrap, undefined/null throw TypeError.
    /// Returns an owned object reference.
    pub fn to_object(&mut self, value: Value) -> OpResult<ObjectId> {
        match value {
            Value::Object(obj) => {
                self.objects.inc_rc(obj);
                Ok(obj)
            }
            Value::Undefined | Value::Null | Value::Empty => {
                Err(self.throw_error(ErrorKind::Type))
            }
            Value::Number(_) => {
                self.new_wrapper_object(ObjectType::NumberObject, MagicStringId::NumberUl, value)
            }
            Value::Bool(_) => {
                self.new_wrapper_object(ObjectType::BooleanObject, MagicStringId::BooleanUl, value)
            }
            Value::Str(id) => {
                let wrapper = self.new_wrapper_object(
                    ObjectType::StringObject,
                    MagicStringId::StringUl,
                    value,
                )?;
                // String wrappers expose a frozen length property; index
                // properties materialize lazily in [[GetOwnProperty]].
                let length = self.strings.text(id).encode_utf16().count() as f64;
                let result = (|ctx: &mut Context| {
                    let pid = ctx.create_named_data_property(
                        wrapper,
                        ctx.strings.magic(MagicStringId::Length),
                        false,
                        false,
                        false,
                    )?;
                    ctx.assign_named_data_value(wrapper, pid, Value::Number(length));
                    Ok(())
                })(self);
                if let Err(abrupt) = result {
                    self.free_value(Value::Object(wrapper));
                    return Err(abrupt);
                }
                Ok(wrapper)
            }
        }
    }

    /// Wrapper objects come back rooted (one owned reference), so the slot
    /// allocations here can never race a collection against them.
    fn new_wrapper_object(
        &mut self,
        object_type: ObjectType,
        class: MagicStringId,
        primitive: Value,
    ) -> OpResult<ObjectId> {
        let proto = self.globals.object_prototype;
        let obj = self.alloc_object(ObjectKind::Ordinary(object_type), Some(proto))?;
        self.objects.inc_rc(obj);

        let result = (|ctx: &mut Context| {
            ctx.set_internal_slot(obj, InternalSlot::Class, class as u32)?;
            let cell = ctx
                .objects
                .cells
                .alloc()
                .ok_or(crate::value::Abrupt::Fatal(crate::value::FatalKind::OutOfMemory))?;
            ctx.ref_stored(primitive);
            ctx.objects.cells.get_mut(cell).0 = primitive;
            ctx.note_store(obj, primitive);
            ctx.set_internal_slot(obj, InternalSlot::PrimitiveValue, cell as u32)
        })(self);
        if let Err(abrupt) = result {
            self.free_value(Value::Object(obj));
            return Err(abrupt);
        }
        Ok(obj)
    }

    /// ToInt32 (ES5 9.5).
    pub fn to_int32(&mut self, value: Value) -> OpResult<i32> {
        Ok(double_to_int32(self.to_number(value)?))
    }

    /// ToUint32 (ES5 9.6).
    pub fn to_uint32(&mut self, value: Value) -> OpResult<u32> {
        Ok(double_to_int32(self.to_number(value)?) as u32)
    }

    /// ToPropertyDescriptor (ES5 8.10.5). The returned descriptor owns a
    /// reference on its value and on the getter/setter objects; release with
    /// [`free_property_descriptor`](Context::free_property_descriptor).
    pub fn to_property_descriptor(&mut self, value: Value) -> OpResult<PropertyDescriptor> {
        let Some(attrs) = value.as_object() else {
            return Err(self.throw_error(ErrorKind::Type));
        };

        let mut desc = PropertyDescriptor::default();
        let result = self.fill_property_descriptor(attrs, &mut desc);
        if result.is_err() {
            self.free_property_descriptor(&desc);
        }
        result.map(|()| desc)
    }

    fn fill_property_descriptor(
        &mut self,
        attrs: ObjectId,
        desc: &mut PropertyDescriptor,
    ) -> OpResult<()> {
        for (field, magic) in [
            (0, MagicStringId::Enumerable),
            (1, MagicStringId::Configurable),
            (2, MagicStringId::Value),
            (3, MagicStringId::Writable),
            (4, MagicStringId::Get),
            (5, MagicStringId::Set),
        ] {
            let name = self.strings.magic(magic);
            if self.op_object_get_property(attrs, name)?.is_none() {
                continue;
            }
            let field_value = self.op_object_get(attrs, name)?;
            match field {
                0 => desc.enumerable = Some(self.to_boolean(field_value)),
                1 => desc.configurable = Some(self.to_boolean(field_value)),
                2 => {
                    desc.value = Some(field_value);
                    // Ownership transfers into the descriptor.
                    continue;
                }
                3 => desc.writable = Some(self.to_boolean(field_value)),
                4 | 5 => {
                    let accessor = match field_value {
                        Value::Undefined => None,
                        Value::Object(f) if self.op_is_callable(field_value) => Some(f),
                        _ => {
                            self.free_value(field_value);
                            return Err(self.throw_error(ErrorKind::Type));
                        }
                    };
                    // Keep the accessor alive while the descriptor exists.
                    if field == 4 {
                        desc.get = Some(accessor);
                    } else {
                        desc.set = Some(accessor);
                    }
                    continue;
                }
                _ => unreachable!("field index out of range"),
            }
            self.free_value(field_value);
        }

        if (desc.get.is_some() || desc.set.is_some())
            && (desc.value.is_some() || desc.writable.is_some())
        {
            return Err(self.throw_error(ErrorKind::Type));
        }
        Ok(())
    }

    /// Release the references a ToPropertyDescriptor result holds.
    pub fn free_property_descriptor(&mut self, desc: &PropertyDescriptor) {
        if let Some(value) = desc.value {
            self.free_value(value);
        }
        if let Some(Some(get)) = desc.get {
            self.free_value(Value::Object(get));
        }
        if let Some(Some(set)) = desc.set {
            self.free_value(Value::Object(set));
        }
    }
}

/// The 9.5 modular clamp shared by ToInt32/ToUint32.
pub fn double_to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    const TWO_32: f64 = 4294967296.0;
    let mut m = n.trunc() % TWO_32;
    if m < 0.0 {
        m += TWO_32;
    }
    if m >= TWO_32 / 2.0 {
        (m - TWO_32) as i64 as i32
    } else {
        m as i64 as i32
    }
}
