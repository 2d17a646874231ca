//! Internal methods of objects (ES5 §8.12) and the function-object
//! operations (call, construct, declaration).
//!
//! Dispatch over the special object types (array, arguments, string
//! wrapper, built-in) is a match on the type tag; the general algorithms
//! below follow the numbered steps of the standard.

use crate::context::{BuiltinRoutine, Context, ErrorKind};
use crate::conversion::PreferredType;
use crate::object::{
    InternalSlot, ObjectId, ObjectKind, ObjectType, PropId, PropertyDescriptor, PropertyKind,
};
use crate::strings::{MagicStringId, StringId};
use crate::value::{Abrupt, FatalKind, OpResult, Reference, ReferenceBase, Value};

/// Array index test per ES5 15.4: a canonical numeric string below 2^32-1.
pub fn array_index_of(text: &str) -> Option<u32> {
    if text.is_empty() || (text.len() > 1 && text.starts_with('0')) {
        return None;
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = text.parse().ok()?;
    if index == u32::MAX {
        None
    } else {
        Some(index)
    }
}

impl Context {
    // ========================================================================
    // [[GetOwnProperty]] / [[GetProperty]] (8.12.1, 8.12.2)
    // ========================================================================

    /// [[GetOwnProperty]]. String wrappers materialize their index
    /// properties on first touch (frozen single-char data properties).
    pub fn op_object_get_own_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
    ) -> OpResult<Option<PropId>> {
        if let Some(pid) = self.find_named_property(obj, name) {
            return Ok(Some(pid));
        }

        if self.objects.get(obj).object_type() == Some(ObjectType::StringObject) {
            if let Some(index) = array_index_of(self.strings.text(name)) {
                return self.materialize_string_index(obj, name, index);
            }
        }
        Ok(None)
    }

    fn materialize_string_index(
        &mut self,
        obj: ObjectId,
        name: StringId,
        index: u32,
    ) -> OpResult<Option<PropId>> {
        let Some(cell) = self.internal_slot(obj, InternalSlot::PrimitiveValue) else {
            return Ok(None);
        };
        let Value::Str(text_id) = self.objects.cells.get(cell as u16).0 else {
            return Ok(None);
        };
        let Some(unit) = self.strings.text(text_id).encode_utf16().nth(index as usize) else {
            return Ok(None);
        };
        let ch = String::from_utf16_lossy(&[unit]);
        let ch_id = self.intern_string(&ch)?;

        let pid = self.create_named_data_property(obj, name, false, true, false)?;
        self.assign_named_data_value(obj, pid, Value::Str(ch_id));
        self.strings.deref_string(ch_id);
        Ok(Some(pid))
    }

    /// [[GetProperty]]: own property or the prototype chain's.
    pub fn op_object_get_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
    ) -> OpResult<Option<PropId>> {
        let mut at = obj;
        loop {
            if let Some(pid) = self.op_object_get_own_property(at, name)? {
                return Ok(Some(pid));
            }
            match self.objects.get(at).prototype {
                Some(proto) => at = proto,
                None => return Ok(None),
            }
        }
    }

    pub fn op_object_has_property(&mut self, obj: ObjectId, name: StringId) -> OpResult<bool> {
        Ok(self.op_object_get_property(obj, name)?.is_some())
    }

    // ========================================================================
    // [[Get]] (8.12.3)
    // ========================================================================

    pub fn op_object_get(&mut self, obj: ObjectId, name: StringId) -> OpResult<Value> {
        // 1. - 2.
        let Some(pid) = self.op_object_get_property(obj, name)? else {
            return Ok(Value::Undefined);
        };

        match self.props.get(pid.raw()).kind.clone() {
            // 3.
            PropertyKind::Data { value, .. } => {
                self.ref_value(value);
                Ok(value)
            }
            // 4. - 5. The getter is invoked with the original receiver.
            PropertyKind::Accessor { get: None, .. } => Ok(Value::Undefined),
            PropertyKind::Accessor { get: Some(getter), .. } => {
                self.op_function_call(getter, Value::Object(obj), &[])
            }
            PropertyKind::Internal { .. } => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "internal slot reached through a named lookup",
            ))),
        }
    }

    // ========================================================================
    // [[CanPut]] (8.12.4)
    // ========================================================================

    pub fn op_object_can_put(&mut self, obj: ObjectId, name: StringId) -> OpResult<bool> {
        // 1. - 2.
        if let Some(pid) = self.op_object_get_own_property(obj, name)? {
            return Ok(match &self.props.get(pid.raw()).kind {
                PropertyKind::Accessor { set, .. } => set.is_some(),
                PropertyKind::Data { writable, .. } => *writable,
                PropertyKind::Internal { .. } => false,
            });
        }

        // 3. - 4.
        let Some(proto) = self.objects.get(obj).prototype else {
            return Ok(self.objects.get(obj).extensible);
        };

        // 5. - 6.
        let Some(inherited) = self.op_object_get_property(proto, name)? else {
            return Ok(self.objects.get(obj).extensible);
        };

        // 7. - 8.
        Ok(match &self.props.get(inherited.raw()).kind {
            PropertyKind::Accessor { set, .. } => set.is_some(),
            PropertyKind::Data { writable, .. } => {
                self.objects.get(obj).extensible && *writable
            }
            PropertyKind::Internal { .. } => false,
        })
    }

    // ========================================================================
    // [[Put]] (8.12.5)
    // ========================================================================

    pub fn op_object_put(
        &mut self,
        obj: ObjectId,
        name: StringId,
        value: Value,
        is_throw: bool,
    ) -> OpResult<bool> {
        // 1.
        if !self.op_object_can_put(obj, name)? {
            return self.reject(is_throw);
        }

        // 2. - 3.
        if let Some(own) = self.op_object_get_own_property(obj, name)? {
            if matches!(self.props.get(own.raw()).kind, PropertyKind::Data { .. }) {
                let desc = PropertyDescriptor::value_only(value);
                return self.op_object_define_own_property(obj, name, &desc, is_throw);
            }
        }

        // 4. - 5.
        if let Some(inherited) = self.op_object_get_property(obj, name)? {
            if let PropertyKind::Accessor { set: Some(setter), .. } =
                self.props.get(inherited.raw()).kind
            {
                let result = self.op_function_call(setter, Value::Object(obj), &[value])?;
                self.free_value(result);
                return Ok(true);
            }
        }

        // 6.
        let desc = PropertyDescriptor::data(value);
        self.op_object_define_own_property(obj, name, &desc, is_throw)
    }

    // ========================================================================
    // [[Delete]] (8.12.7)
    // ========================================================================

    pub fn op_object_delete(
        &mut self,
        obj: ObjectId,
        name: StringId,
        is_throw: bool,
    ) -> OpResult<bool> {
        // 1. - 2.
        let Some(pid) = self.op_object_get_own_property(obj, name)? else {
            return Ok(true);
        };

        // 3. - 5.
        if self.props.get(pid.raw()).is_configurable() {
            self.delete_property(obj, pid);
            Ok(true)
        } else {
            self.reject(is_throw)
        }
    }

    // ========================================================================
    // [[DefaultValue]] (8.12.8)
    // ========================================================================

    pub fn op_object_default_value(
        &mut self,
        obj: ObjectId,
        hint: PreferredType,
    ) -> OpResult<Value> {
        let hint = if hint == PreferredType::None {
            let class = self.internal_slot(obj, InternalSlot::Class);
            if class == Some(MagicStringId::DateUl as u32) {
                PreferredType::String
            } else {
                PreferredType::Number
            }
        } else {
            hint
        };

        for round in 1..=2u32 {
            let method_name = if (round == 1) == (hint == PreferredType::String) {
                MagicStringId::ToString
            } else {
                MagicStringId::ValueOf
            };
            let name = self.strings.magic(method_name);
            let method = self.op_object_get(obj, name)?;
            if self.op_is_callable(method) {
                let func = method.as_object().expect("callable implies object");
                let result = self.op_function_call(func, Value::Object(obj), &[]);
                self.free_value(method);
                let result = result?;
                if result.as_object().is_none() {
                    return Ok(result);
                }
                self.free_value(result);
            } else {
                self.free_value(method);
            }
        }

        Err(self.throw_error(ErrorKind::Type))
    }

    // ========================================================================
    // [[DefineOwnProperty]] (8.12.9, with the 15.4.5.1 array override)
    // ========================================================================

    pub fn op_object_define_own_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
        desc: &PropertyDescriptor,
        is_throw: bool,
    ) -> OpResult<bool> {
        match self.objects.get(obj).object_type() {
            Some(ObjectType::Array) => self.array_define_own_property(obj, name, desc, is_throw),
            _ => self.general_define_own_property(obj, name, desc, is_throw),
        }
    }

    fn general_define_own_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
        desc: &PropertyDescriptor,
        is_throw: bool,
    ) -> OpResult<bool> {
        // 1. - 2.
        let current = self.op_object_get_own_property(obj, name)?;
        let extensible = self.objects.get(obj).extensible;

        let Some(current) = current else {
            // 3.
            if !extensible {
                return self.reject(is_throw);
            }
            // 4.a / 4.b: absent fields default to false/undefined.
            if desc.is_generic_descriptor() || desc.is_data_descriptor() {
                let pid = self.create_named_data_property(
                    obj,
                    name,
                    desc.writable.unwrap_or(false),
                    desc.enumerable.unwrap_or(false),
                    desc.configurable.unwrap_or(false),
                )?;
                self.assign_named_data_value(obj, pid, desc.value.unwrap_or(Value::Undefined));
            } else {
                self.create_named_accessor_property(
                    obj,
                    name,
                    desc.get.unwrap_or(None),
                    desc.set.unwrap_or(None),
                    desc.enumerable.unwrap_or(false),
                    desc.configurable.unwrap_or(false),
                )?;
            }
            return Ok(true);
        };

        // 5.
        if desc.is_generic_descriptor()
            && desc.enumerable.is_none()
            && desc.configurable.is_none()
        {
            return Ok(true);
        }

        // 6. "Every field in desc also occurs in current and has the same
        // value" - value comparison is SameValue, so NaN and the zero signs
        // behave.
        if self.descriptor_matches_current(current, desc) {
            return Ok(true);
        }

        let node = self.props.get(current.raw());
        let current_configurable = node.is_configurable();
        let current_enumerable = node.is_enumerable();
        let current_is_data = matches!(node.kind, PropertyKind::Data { .. });

        // 7.
        if !current_configurable {
            if desc.configurable == Some(true)
                || desc
                    .enumerable
                    .is_some_and(|e| e != current_enumerable)
            {
                return self.reject(is_throw);
            }
        }

        let mut current = current;
        if desc.is_generic_descriptor() {
            // 8. No further validation.
        } else if desc.is_data_descriptor() != current_is_data {
            // 9. Conversion between descriptor kinds.
            if !current_configurable {
                return self.reject(is_throw);
            }
            self.delete_property(obj, current);
            current = if current_is_data {
                // 9.b: data -> accessor, attributes preserved.
                self.create_named_accessor_property(
                    obj,
                    name,
                    None,
                    None,
                    current_enumerable,
                    current_configurable,
                )?
            } else {
                // 9.c: accessor -> data.
                self.create_named_data_property(
                    obj,
                    name,
                    false,
                    current_enumerable,
                    current_configurable,
                )?
            };
        } else if current_is_data {
            // 10.
            if !current_configurable {
                let writable = match &self.props.get(current.raw()).kind {
                    PropertyKind::Data { writable, .. } => *writable,
                    _ => false,
                };
                if !writable {
                    if desc.writable == Some(true) {
                        return self.reject(is_throw);
                    }
                    if let Some(new_value) = desc.value {
                        let old_value = self.named_data_value(current);
                        if !self.same_value(new_value, old_value) {
                            return self.reject(is_throw);
                        }
                    }
                }
            }
        } else {
            // 11.
            if !current_configurable {
                if let PropertyKind::Accessor { get, set, .. } = self.props.get(current.raw()).kind
                {
                    if desc.get.is_some_and(|g| g != get) || desc.set.is_some_and(|s| s != set) {
                        return self.reject(is_throw);
                    }
                }
            }
        }

        // 12. Apply every present field.
        if let Some(value) = desc.value {
            self.assign_named_data_value(obj, current, value);
        }
        let node = self.props.get_mut(current.raw());
        match &mut node.kind {
            PropertyKind::Data { writable, enumerable, configurable, .. } => {
                if let Some(w) = desc.writable {
                    *writable = w;
                }
                if let Some(e) = desc.enumerable {
                    *enumerable = e;
                }
                if let Some(c) = desc.configurable {
                    *configurable = c;
                }
            }
            PropertyKind::Accessor { get, set, enumerable, configurable } => {
                if let Some(g) = desc.get {
                    *get = g;
                }
                if let Some(s) = desc.set {
                    *set = s;
                }
                if let Some(e) = desc.enumerable {
                    *enumerable = e;
                }
                if let Some(c) = desc.configurable {
                    *configurable = c;
                }
            }
            PropertyKind::Internal { .. } => {}
        }
        if let Some(Some(getter)) = desc.get {
            self.note_object_store(obj, getter);
        }
        if let Some(Some(setter)) = desc.set {
            self.note_object_store(obj, setter);
        }
        Ok(true)
    }

    fn descriptor_matches_current(&self, current: PropId, desc: &PropertyDescriptor) -> bool {
        let node = self.props.get(current.raw());
        let mut matches = true;
        match &node.kind {
            PropertyKind::Data { value, writable, enumerable, configurable, .. } => {
                if let Some(v) = desc.value {
                    matches &= self.same_value(v, *value);
                }
                matches &= desc.writable.map_or(true, |w| w == *writable);
                matches &= desc.get.is_none() && desc.set.is_none();
                matches &= desc.enumerable.map_or(true, |e| e == *enumerable);
                matches &= desc.configurable.map_or(true, |c| c == *configurable);
            }
            PropertyKind::Accessor { get, set, enumerable, configurable } => {
                matches &= desc.value.is_none() && desc.writable.is_none();
                matches &= desc.get.map_or(true, |g| g == *get);
                matches &= desc.set.map_or(true, |s| s == *set);
                matches &= desc.enumerable.map_or(true, |e| e == *enumerable);
                matches &= desc.configurable.map_or(true, |c| c == *configurable);
            }
            PropertyKind::Internal { .. } => matches = false,
        }
        matches
    }

    /// 15.4.5.1: array objects special-case "length" and index properties.
    fn array_define_own_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
        desc: &PropertyDescriptor,
        is_throw: bool,
    ) -> OpResult<bool> {
        let length_name = self.strings.magic(MagicStringId::Length);

        if name == length_name {
            let Some(new_value) = desc.value else {
                return self.general_define_own_property(obj, name, desc, is_throw);
            };
            let new_len = self.to_uint32(new_value)?;
            let as_number = self.to_number(new_value)?;
            if new_len as f64 != as_number {
                return Err(self.throw_error(ErrorKind::Range));
            }

            let old_len = self.array_length(obj)?;
            let mut len_desc = *desc;
            len_desc.value = Some(Value::Number(new_len as f64));

            if new_len >= old_len {
                return self.general_define_own_property(obj, length_name, &len_desc, is_throw);
            }

            if !self.array_length_writable(obj)? {
                return self.reject(is_throw);
            }
            if !self.general_define_own_property(obj, length_name, &len_desc, is_throw)? {
                return Ok(false);
            }
            // Delete the elements beyond the new length, highest first.
            let mut at = old_len;
            while at > new_len {
                at -= 1;
                let index_name = self.string_from_u32(at)?;
                let deleted = self.op_object_delete(obj, index_name, false)?;
                self.strings.deref_string(index_name);
                if !deleted {
                    let fixup =
                        PropertyDescriptor::value_only(Value::Number((at + 1) as f64));
                    self.general_define_own_property(obj, length_name, &fixup, false)?;
                    return self.reject(is_throw);
                }
            }
            return Ok(true);
        }

        if let Some(index) = array_index_of(self.strings.text(name)) {
            let old_len = self.array_length(obj)?;
            if index >= old_len && !self.array_length_writable(obj)? {
                return self.reject(is_throw);
            }
            if !self.general_define_own_property(obj, name, desc, false)? {
                return self.reject(is_throw);
            }
            if index >= old_len {
                let bump = PropertyDescriptor::value_only(Value::Number((index + 1) as f64));
                self.general_define_own_property(obj, length_name, &bump, false)?;
            }
            return Ok(true);
        }

        self.general_define_own_property(obj, name, desc, is_throw)
    }

    fn array_length(&mut self, obj: ObjectId) -> OpResult<u32> {
        let length_name = self.strings.magic(MagicStringId::Length);
        let pid = self
            .find_named_property(obj, length_name)
            .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("array without length")))?;
        match self.named_data_value(pid) {
            Value::Number(n) => Ok(n as u32),
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage("array length not a number"))),
        }
    }

    fn array_length_writable(&mut self, obj: ObjectId) -> OpResult<bool> {
        let length_name = self.strings.magic(MagicStringId::Length);
        let pid = self
            .find_named_property(obj, length_name)
            .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("array without length")))?;
        Ok(match self.props.get(pid.raw()).kind {
            PropertyKind::Data { writable, .. } => writable,
            _ => false,
        })
    }

    pub(crate) fn string_from_u32(&mut self, n: u32) -> OpResult<StringId> {
        if let Some(id) = self.strings.from_u32(n) {
            return Ok(id);
        }
        self.try_give_memory_back(crate::mem::GcSeverity::Critical);
        self.strings
            .from_u32(n)
            .ok_or(Abrupt::Fatal(FatalKind::OutOfMemory))
    }

    fn reject(&mut self, is_throw: bool) -> OpResult<bool> {
        if is_throw {
            Err(self.throw_error(ErrorKind::Type))
        } else {
            Ok(false)
        }
    }

    // ========================================================================
    // Callables
    // ========================================================================

    pub fn op_is_callable(&self, value: Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        match self.objects.get(obj).object_type() {
            Some(ObjectType::Function) => true,
            Some(ObjectType::Builtin) => {
                self.internal_slot(obj, InternalSlot::BuiltinId).is_some()
            }
            _ => false,
        }
    }

    pub fn op_is_constructor(&self, value: Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        match self.objects.get(obj).object_type() {
            Some(ObjectType::Function) => true,
            Some(ObjectType::Builtin) => matches!(
                self.internal_slot(obj, InternalSlot::BuiltinId)
                    .and_then(BuiltinRoutine::decode),
                Some(BuiltinRoutine::ObjectConstructor)
                    | Some(BuiltinRoutine::ErrorConstructor(_))
            ),
            _ => false,
        }
    }

    /// [[Call]] (13.2.1): fresh declarative environment over the function's
    /// scope, formals bound to arguments, `arguments` object when not
    /// shadowed, non-strict `this` coercion, then a nested interpreter
    /// entry.
    pub fn op_function_call(
        &mut self,
        func: ObjectId,
        this: Value,
        args: &[Value],
    ) -> OpResult<Value> {
        if self.call_depth >= self.max_call_depth {
            return Err(self.throw_error(ErrorKind::Range));
        }

        if let Some(routine) = self
            .internal_slot(func, InternalSlot::BuiltinId)
            .and_then(BuiltinRoutine::decode)
        {
            self.call_depth += 1;
            let result = self.dispatch_builtin(routine, this, args);
            self.call_depth -= 1;
            return result;
        }

        if self.objects.get(func).object_type() != Some(ObjectType::Function) {
            return Err(self.throw_error(ErrorKind::Type));
        }

        let scope = self
            .internal_slot(func, InternalSlot::Scope)
            .and_then(|raw| ObjectId::from_raw(raw as u16))
            .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("function without scope")))?;
        let code_pos = self
            .internal_slot(func, InternalSlot::CodePosition)
            .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("function without code")))?
            as u16;
        let strict = self
            .internal_slot(func, InternalSlot::StrictCode)
            .unwrap_or(0)
            != 0;
        let params: Vec<StringId> = self
            .internal_slot(func, InternalSlot::FormalParams)
            .map(|handle| self.objects.params.get(handle as u16).0.clone())
            .unwrap_or_default();

        // 10.4.3: this-binding coercion for non-strict code.
        let this_binding = if strict {
            self.ref_value(this);
            this
        } else if this.is_nullish() {
            let global = self.globals.global_obj;
            self.objects.inc_rc(global);
            Value::Object(global)
        } else if this.as_object().is_some() {
            self.ref_value(this);
            this
        } else {
            Value::Object(self.to_object(this)?)
        };

        let env = match self.create_decl_env(Some(scope)) {
            Ok(env) => env,
            Err(abrupt) => {
                self.free_value(this_binding);
                return Err(abrupt);
            }
        };
        self.objects.inc_rc(env);

        let result = self.bind_invocation(env, func, &params, args, strict);
        let completion = match result {
            Ok(()) => {
                self.call_depth += 1;
                let completion =
                    self.run_from_pos(code_pos, this_binding, env, strict, false);
                self.call_depth -= 1;
                completion
            }
            Err(abrupt) => abrupt.into(),
        };

        self.objects.dec_rc(env);
        self.free_value(this_binding);

        match completion {
            crate::value::Completion::Return(v) => Ok(v),
            crate::value::Completion::Empty => Ok(Value::Undefined),
            crate::value::Completion::Throw(v) => Err(Abrupt::Throw(v)),
            crate::value::Completion::Exit(ok) => Err(Abrupt::Exit(ok)),
            crate::value::Completion::Fatal(kind) => Err(Abrupt::Fatal(kind)),
            crate::value::Completion::Meta => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "function body ended at a stray marker",
            ))),
        }
    }

    /// Declaration binding instantiation for one invocation (10.5 blocks
    /// 4 and 6-7).
    fn bind_invocation(
        &mut self,
        env: ObjectId,
        func: ObjectId,
        params: &[StringId],
        args: &[Value],
        strict: bool,
    ) -> OpResult<()> {
        for (at, &name) in params.iter().enumerate() {
            let value = args.get(at).copied().unwrap_or(Value::Undefined);
            if !self.op_has_binding(env, name)? {
                self.op_create_mutable_binding(env, name, false)?;
            }
            self.op_set_mutable_binding(env, name, value, strict)?;
        }

        let arguments_name = self.strings.magic(MagicStringId::Arguments);
        if !params.contains(&arguments_name) {
            let args_obj = self.create_arguments_object(func, args, strict)?;
            self.op_create_mutable_binding(env, arguments_name, false)?;
            self.op_set_mutable_binding(env, arguments_name, Value::Object(args_obj), false)?;
            self.objects.dec_rc(args_obj);
        }
        Ok(())
    }

    /// [[Construct]] (13.2.2).
    pub fn op_function_construct(&mut self, func: ObjectId, args: &[Value]) -> OpResult<Value> {
        if let Some(routine) = self
            .internal_slot(func, InternalSlot::BuiltinId)
            .and_then(BuiltinRoutine::decode)
        {
            return self.dispatch_builtin(routine, Value::Undefined, args);
        }

        // 5. - 7.: prototype from the "prototype" property, with the
        // Object.prototype fallback.
        let prototype_name = self.strings.magic(MagicStringId::Prototype);
        let proto_value = self.op_object_get(func, prototype_name)?;
        let proto = proto_value.as_object().unwrap_or(self.globals.object_prototype);

        let obj = self.alloc_object(ObjectKind::Ordinary(ObjectType::General), Some(proto));
        self.free_value(proto_value);
        let obj = obj?;
        self.objects.inc_rc(obj);
        if let Err(abrupt) =
            self.set_internal_slot(obj, InternalSlot::Class, MagicStringId::ObjectUl as u32)
        {
            self.free_value(Value::Object(obj));
            return Err(abrupt);
        }

        // 8. - 10.: an object result overrides the fresh instance.
        let result = self.op_function_call(func, Value::Object(obj), args);
        match result {
            Ok(value) if value.as_object().is_some() => {
                self.free_value(Value::Object(obj));
                Ok(value)
            }
            Ok(value) => {
                self.free_value(value);
                Ok(Value::Object(obj))
            }
            Err(abrupt) => {
                self.free_value(Value::Object(obj));
                Err(abrupt)
            }
        }
    }

    /// Create a function object (13.2): scope, code, formals and strictness
    /// in internal slots, frozen `length`, fresh `prototype` object.
    pub fn op_create_function_object(
        &mut self,
        params: &[StringId],
        scope: ObjectId,
        strict: bool,
        code_pos: u16,
    ) -> OpResult<ObjectId> {
        let func = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::Function),
            Some(self.globals.function_prototype),
        )?;
        self.objects.inc_rc(func);
        self.set_internal_slot(func, InternalSlot::Class, MagicStringId::FunctionUl as u32)?;
        self.set_scope_slot(func, scope)?;
        self.set_internal_slot(func, InternalSlot::CodePosition, code_pos as u32)?;
        self.set_internal_slot(func, InternalSlot::StrictCode, strict as u32)?;

        let params_handle = self
            .objects
            .params
            .alloc()
            .ok_or(Abrupt::Fatal(FatalKind::OutOfMemory))?;
        for &name in params {
            self.strings.ref_string(name);
        }
        self.objects.params.get_mut(params_handle).0 = params.to_vec();
        self.set_internal_slot(func, InternalSlot::FormalParams, params_handle as u32)?;

        let length_name = self.strings.magic(MagicStringId::Length);
        let pid = self.create_named_data_property(func, length_name, false, false, false)?;
        self.assign_named_data_value(func, pid, Value::Number(params.len() as f64));

        // 13.2 steps 16-18: the .prototype object with its constructor
        // back-link. Rooted until it hangs off the function.
        let proto = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::General),
            Some(self.globals.object_prototype),
        )?;
        self.objects.inc_rc(proto);
        let linked = (|ctx: &mut Context| {
            ctx.set_internal_slot(proto, InternalSlot::Class, MagicStringId::ObjectUl as u32)?;
            let ctor_name = ctx.strings.magic(MagicStringId::Constructor);
            let pid = ctx.create_named_data_property(proto, ctor_name, true, false, true)?;
            ctx.assign_named_data_value(proto, pid, Value::Object(func));

            let prototype_name = ctx.strings.magic(MagicStringId::Prototype);
            let pid = ctx.create_named_data_property(func, prototype_name, true, false, false)?;
            ctx.assign_named_data_value(func, pid, Value::Object(proto));
            Ok(())
        })(self);
        self.objects.dec_rc(proto);
        if let Err(abrupt) = linked {
            self.free_value(Value::Object(func));
            return Err(abrupt);
        }

        Ok(func)
    }

    /// Function declaration binding (10.5 block 5).
    pub fn op_function_declaration(
        &mut self,
        env: ObjectId,
        name: StringId,
        params: &[StringId],
        code_pos: u16,
        strict: bool,
        configurable_bindings: bool,
    ) -> OpResult<()> {
        let func = self.op_create_function_object(params, env, strict, code_pos)?;
        let result = (|ctx: &mut Context| {
            if !ctx.op_has_binding(env, name)? {
                ctx.op_create_mutable_binding(env, name, configurable_bindings)?;
            }
            ctx.op_set_mutable_binding(env, name, Value::Object(func), strict)
        })(self);
        self.free_value(Value::Object(func));
        result
    }

    // ========================================================================
    // Initializer objects
    // ========================================================================

    /// A plain `{}` (15.2.2.1 without arguments).
    pub fn op_create_object_object(&mut self) -> OpResult<ObjectId> {
        let obj = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::General),
            Some(self.globals.object_prototype),
        )?;
        // Rooted before any further allocation can trigger a collection.
        self.objects.inc_rc(obj);
        if let Err(abrupt) =
            self.set_internal_slot(obj, InternalSlot::Class, MagicStringId::ObjectUl as u32)
        {
            self.free_value(Value::Object(obj));
            return Err(abrupt);
        }
        Ok(obj)
    }

    /// Array initializer (11.1.4): elements and the writable length.
    pub fn op_create_array_object(&mut self, elements: &[Value]) -> OpResult<Value> {
        let array = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::Array),
            Some(self.globals.object_prototype),
        )?;
        self.objects.inc_rc(array);
        let result = (|ctx: &mut Context| {
            ctx.set_internal_slot(array, InternalSlot::Class, MagicStringId::ArrayUl as u32)?;
            let length_name = ctx.strings.magic(MagicStringId::Length);
            let pid = ctx.create_named_data_property(array, length_name, true, false, false)?;
            ctx.assign_named_data_value(array, pid, Value::Number(elements.len() as f64));

            for (at, &element) in elements.iter().enumerate() {
                let index_name = ctx.string_from_u32(at as u32)?;
                let pid = ctx.create_named_data_property(array, index_name, true, true, true)?;
                ctx.assign_named_data_value(array, pid, element);
                ctx.strings.deref_string(index_name);
            }
            Ok(())
        })(self);
        match result {
            Ok(()) => Ok(Value::Object(array)),
            Err(abrupt) => {
                self.free_value(Value::Object(array));
                Err(abrupt)
            }
        }
    }

    /// The arguments object (10.6, without the live parameter map).
    fn create_arguments_object(
        &mut self,
        func: ObjectId,
        args: &[Value],
        strict: bool,
    ) -> OpResult<ObjectId> {
        let obj = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::Arguments),
            Some(self.globals.object_prototype),
        )?;
        self.objects.inc_rc(obj);
        self.set_internal_slot(obj, InternalSlot::Class, MagicStringId::ArgumentsUl as u32)?;

        let length_name = self.strings.magic(MagicStringId::Length);
        let pid = self.create_named_data_property(obj, length_name, true, false, true)?;
        self.assign_named_data_value(obj, pid, Value::Number(args.len() as f64));

        for (at, &arg) in args.iter().enumerate() {
            let index_name = self.string_from_u32(at as u32)?;
            let pid = self.create_named_data_property(obj, index_name, true, true, true)?;
            self.assign_named_data_value(obj, pid, arg);
            self.strings.deref_string(index_name);
        }

        if !strict {
            let callee_name = self.strings.magic(MagicStringId::Callee);
            let pid = self.create_named_data_property(obj, callee_name, true, false, true)?;
            self.assign_named_data_value(obj, pid, Value::Object(func));
        }
        Ok(obj)
    }

    // ========================================================================
    // Built-in dispatch
    // ========================================================================

    fn dispatch_builtin(
        &mut self,
        routine: BuiltinRoutine,
        _this: Value,
        args: &[Value],
    ) -> OpResult<Value> {
        match routine {
            BuiltinRoutine::ObjectConstructor => {
                let arg = args.first().copied().unwrap_or(Value::Undefined);
                if arg.is_nullish() {
                    Ok(Value::Object(self.op_create_object_object()?))
                } else {
                    Ok(Value::Object(self.to_object(arg)?))
                }
            }
            BuiltinRoutine::ObjectDefineProperty => {
                let target = args.first().copied().unwrap_or(Value::Undefined);
                let Some(obj) = target.as_object() else {
                    return Err(self.throw_error(ErrorKind::Type));
                };
                let name_arg = args.get(1).copied().unwrap_or(Value::Undefined);
                let attrs = args.get(2).copied().unwrap_or(Value::Undefined);

                let name = self.to_string_value(name_arg)?;
                let desc = match self.to_property_descriptor(attrs) {
                    Ok(desc) => desc,
                    Err(abrupt) => {
                        self.strings.deref_string(name);
                        return Err(abrupt);
                    }
                };
                let result = self.op_object_define_own_property(obj, name, &desc, true);
                self.free_property_descriptor(&desc);
                self.strings.deref_string(name);
                result?;
                self.ref_value(target);
                Ok(target)
            }
            BuiltinRoutine::ErrorConstructor(kind) => {
                let error = self.new_standard_error(kind)?;
                let message = args.first().copied().unwrap_or(Value::Undefined);
                if !message.is_undefined() {
                    let obj = error.as_object().expect("standard error is an object");
                    let text = match self.to_string_value(message) {
                        Ok(text) => text,
                        Err(abrupt) => {
                            self.free_value(error);
                            return Err(abrupt);
                        }
                    };
                    let message_name = self.strings.magic(MagicStringId::Message);
                    let pid =
                        self.create_named_data_property(obj, message_name, true, false, true)?;
                    self.assign_named_data_value(obj, pid, Value::Str(text));
                    self.strings.deref_string(text);
                }
                Ok(error)
            }
        }
    }

    // ========================================================================
    // Operators over objects
    // ========================================================================

    /// `instanceof` (11.8.6 with 15.3.5.3 [[HasInstance]]).
    pub fn op_instanceof(&mut self, value: Value, target: Value) -> OpResult<bool> {
        if !self.op_is_callable(target) {
            return Err(self.throw_error(ErrorKind::Type));
        }
        let ctor = target.as_object().expect("callable implies object");

        let prototype_name = self.strings.magic(MagicStringId::Prototype);
        let expected = self.op_object_get(ctor, prototype_name)?;
        let Some(expected_proto) = expected.as_object() else {
            self.free_value(expected);
            return Err(self.throw_error(ErrorKind::Type));
        };

        let mut found = false;
        let mut at = value.as_object().and_then(|obj| self.objects.get(obj).prototype);
        while let Some(proto) = at {
            if proto == expected_proto {
                found = true;
                break;
            }
            at = self.objects.get(proto).prototype;
        }
        self.free_value(expected);
        Ok(found)
    }

    // ========================================================================
    // References (8.7): GetValue / PutValue on value bases
    // ========================================================================

    /// GetValue on a property reference.
    pub fn get_value_object_base(&mut self, reference: &Reference) -> OpResult<Value> {
        match reference.base {
            ReferenceBase::Value(Value::Object(obj)) => self.op_object_get(obj, reference.name),
            ReferenceBase::Value(base) => {
                // Primitive base: operate on a transient wrapper.
                let wrapper = self.to_object(base)?;
                let result = self.op_object_get(wrapper, reference.name);
                self.free_value(Value::Object(wrapper));
                result
            }
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "property reference without a value base",
            ))),
        }
    }

    /// PutValue on a property reference.
    pub fn put_value_object_base(&mut self, reference: &Reference, value: Value) -> OpResult<()> {
        match reference.base {
            ReferenceBase::Value(Value::Object(obj)) => {
                self.op_object_put(obj, reference.name, value, reference.strict)?;
                Ok(())
            }
            ReferenceBase::Value(base) => {
                let wrapper = self.to_object(base)?;
                let result =
                    self.op_object_put(wrapper, reference.name, value, reference.strict);
                self.free_value(Value::Object(wrapper));
                result.map(|_| ())
            }
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "property reference without a value base",
            ))),
        }
    }
}
