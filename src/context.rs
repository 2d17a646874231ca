//! The execution context: every run-wide singleton (program image, arenas,
//! string table, caches, the global object and environment) owned by one
//! struct, so double-initialization is unrepresentable.
//!
//! # Value ownership
//!
//! Two reference disciplines coexist, and every call site must pick the
//! right one:
//!
//! * **External references** (registers, frame bindings, API roots,
//!   transient handler copies) go through [`ref_value`](Context::ref_value)
//!   / [`free_value`](Context::free_value). They count on both strings and
//!   objects; an object with `rc > 0` is a GC root.
//! * **Graph references** (property values, internal slots, prototype and
//!   environment links) go through [`ref_stored`](Context::ref_stored) /
//!   [`free_stored`](Context::free_stored). They count on strings only;
//!   object-to-object edges are traced by the collector, which is what makes
//!   cycles collectable.
//!
//! Functions returning `OpResult<Value>` hand the caller an owned external
//! reference; the caller frees it or transfers it onward.

use crate::error::EngineError;
use crate::mem::{GcSeverity, MemStats, SlotPool};
use crate::object::{
    InternalSlot, LCache, ObjectArena, ObjectId, ObjectKind, ObjectType, PropId, PropertyKind,
    PropertyNode,
};
use crate::strings::{MagicStringId, StringId, StringTable};
use crate::value::{Abrupt, FatalKind, OpResult, Value};
use crate::vm::opcode::{LitId, Literal, Program};

/// Default string-payload heap size in bytes.
pub const DEFAULT_HEAP_SIZE: u32 = 64 * 1024;

/// Default recursion limit for nested interpreter entries.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 256;

/// Standard error constructor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Type,
    Reference,
    Range,
    Syntax,
    Uri,
}

pub const ERROR_KIND_COUNT: usize = 6;

impl ErrorKind {
    pub fn index(self) -> usize {
        match self {
            ErrorKind::Error => 0,
            ErrorKind::Type => 1,
            ErrorKind::Reference => 2,
            ErrorKind::Range => 3,
            ErrorKind::Syntax => 4,
            ErrorKind::Uri => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => ErrorKind::Error,
            1 => ErrorKind::Type,
            2 => ErrorKind::Reference,
            3 => ErrorKind::Range,
            4 => ErrorKind::Syntax,
            5 => ErrorKind::Uri,
            _ => return None,
        })
    }

    pub fn class_magic(self) -> MagicStringId {
        match self {
            ErrorKind::Error => MagicStringId::ErrorUl,
            ErrorKind::Type => MagicStringId::TypeErrorUl,
            ErrorKind::Reference => MagicStringId::ReferenceErrorUl,
            ErrorKind::Range => MagicStringId::RangeErrorUl,
            ErrorKind::Syntax => MagicStringId::SyntaxErrorUl,
            ErrorKind::Uri => MagicStringId::UriErrorUl,
        }
    }
}

/// Native routines reachable through the built-in dispatch contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRoutine {
    ObjectConstructor,
    ObjectDefineProperty,
    ErrorConstructor(ErrorKind),
}

impl BuiltinRoutine {
    pub fn encode(self) -> u32 {
        match self {
            BuiltinRoutine::ObjectConstructor => 0,
            BuiltinRoutine::ObjectDefineProperty => 1,
            BuiltinRoutine::ErrorConstructor(kind) => 2 + kind.index() as u32,
        }
    }

    pub fn decode(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => BuiltinRoutine::ObjectConstructor,
            1 => BuiltinRoutine::ObjectDefineProperty,
            n => BuiltinRoutine::ErrorConstructor(ErrorKind::from_index(n as usize - 2)?),
        })
    }
}

/// Handles the context keeps alive for the whole run.
pub struct Globals {
    pub global_obj: ObjectId,
    pub global_env: ObjectId,
    pub object_prototype: ObjectId,
    pub function_prototype: ObjectId,
    pub error_prototypes: [ObjectId; ERROR_KIND_COUNT],
}

/// The engine state shared by every subsystem.
pub struct Context {
    pub program: Program,
    pub strings: StringTable,
    pub objects: ObjectArena,
    pub props: SlotPool<PropertyNode>,
    pub lcache: LCache,
    pub globals: Globals,
    /// Values pinned by the embedding API.
    pub strong_roots: Vec<Value>,
    pub call_depth: u32,
    pub max_call_depth: u32,
    pub dump_mem_stats: bool,
    pub(crate) mem_trace_indent: u32,
}

impl Context {
    /// Build the context and the run-wide ECMA singletons. Fails only on
    /// impossible initial allocation.
    pub fn new(program: Program, heap_size: u32, dump_mem_stats: bool) -> Result<Self, EngineError> {
        program.validate()?;

        // The bootstrap needs a little room before the recovery cascade can
        // meaningfully help.
        let heap_size = heap_size.max(4 * 1024);

        let mut ctx = Context {
            program,
            strings: StringTable::new(heap_size),
            objects: ObjectArena::new(),
            props: SlotPool::new(),
            lcache: LCache::new(),
            globals: Globals {
                // Filled in by init_builtins; dangling until then.
                global_obj: ObjectId::from_raw(1).expect("nonzero"),
                global_env: ObjectId::from_raw(1).expect("nonzero"),
                object_prototype: ObjectId::from_raw(1).expect("nonzero"),
                function_prototype: ObjectId::from_raw(1).expect("nonzero"),
                error_prototypes: [ObjectId::from_raw(1).expect("nonzero"); ERROR_KIND_COUNT],
            },
            strong_roots: Vec::new(),
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            dump_mem_stats,
            mem_trace_indent: 0,
        };
        ctx.init_builtins()
            .map_err(|_| EngineError::OutOfMemory)?;
        Ok(ctx)
    }

    // ========================================================================
    // Value reference accounting
    // ========================================================================

    /// Take an external strong reference (register slot, frame binding,
    /// transient copy, API root).
    pub fn ref_value(&mut self, value: Value) {
        match value {
            Value::Str(id) => self.strings.ref_string(id),
            Value::Object(id) => self.objects.inc_rc(id),
            _ => {}
        }
    }

    /// Release an external strong reference.
    pub fn free_value(&mut self, value: Value) {
        match value {
            Value::Str(id) => self.strings.deref_string(id),
            Value::Object(id) => self.objects.dec_rc(id),
            _ => {}
        }
    }

    /// Take a graph reference: strings are counted, objects are traced.
    pub fn ref_stored(&mut self, value: Value) {
        if let Value::Str(id) = value {
            self.strings.ref_string(id);
        }
    }

    /// Release a graph reference.
    pub fn free_stored(&mut self, value: Value) {
        if let Value::Str(id) = value {
            self.strings.deref_string(id);
        }
    }

    /// Record that `container` now references `value`. Keeps the
    /// generational may-reference-younger hint coherent.
    pub fn note_store(&mut self, container: ObjectId, value: Value) {
        if let Value::Object(target) = value {
            self.note_object_store(container, target);
        }
    }

    pub fn note_object_store(&mut self, container: ObjectId, target: ObjectId) {
        if self.objects.get(target).young && !self.objects.get(container).young {
            self.objects.get_mut(container).may_ref_young = true;
        }
    }

    // ========================================================================
    // Allocation with the recovery cascade
    // ========================================================================

    /// Run an allocation attempt through the recovery cascade: on failure
    /// drop the LCache and collect (young first, then everything), and only
    /// then report out-of-memory.
    fn with_recovery<T>(
        &mut self,
        mut attempt: impl FnMut(&mut Context) -> Option<T>,
    ) -> OpResult<T> {
        if let Some(v) = attempt(self) {
            return Ok(v);
        }
        self.try_give_memory_back(GcSeverity::Low);
        if let Some(v) = attempt(self) {
            return Ok(v);
        }
        self.try_give_memory_back(GcSeverity::Critical);
        attempt(self).ok_or(Abrupt::Fatal(FatalKind::OutOfMemory))
    }

    pub fn alloc_object(
        &mut self,
        kind: ObjectKind,
        prototype: Option<ObjectId>,
    ) -> OpResult<ObjectId> {
        let id = self.with_recovery(|ctx| ctx.objects.alloc(kind, prototype))?;
        if let Some(proto) = prototype {
            self.note_object_store(id, proto);
        }
        Ok(id)
    }

    pub fn intern_string(&mut self, text: &str) -> OpResult<StringId> {
        self.with_recovery(|ctx| ctx.strings.intern(text))
    }

    fn alloc_prop(&mut self) -> OpResult<PropId> {
        let raw = self.with_recovery(|ctx| ctx.props.alloc())?;
        PropId::from_raw(raw).ok_or(Abrupt::Fatal(FatalKind::OutOfMemory))
    }

    // ========================================================================
    // Literals
    // ========================================================================

    /// Resolve an opcode-field uid to a literal id through the innermost
    /// scope map.
    pub fn lit_id_for_uid(&self, uid: u8, at: u16) -> OpResult<LitId> {
        self.program
            .lit_id_for_uid(uid, at)
            .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("unmapped literal uid")))
    }

    /// Identifier literal → owned string reference.
    pub fn string_from_lit(&mut self, id: LitId) -> OpResult<StringId> {
        match self.program.literal(id) {
            Some(Literal::Ident(name)) => {
                let name = name.clone();
                self.intern_string(&name)
            }
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "literal is not an identifier",
            ))),
        }
    }

    pub fn number_from_lit(&self, id: LitId) -> OpResult<f64> {
        match self.program.literal(id) {
            Some(Literal::Number(n)) => Ok(*n),
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "literal is not a number",
            ))),
        }
    }

    // ========================================================================
    // Property lists
    // ========================================================================

    /// Find a named own property, consulting the LCache first.
    pub fn find_named_property(&mut self, obj: ObjectId, name: StringId) -> Option<PropId> {
        if let Some(hit) = self.lcache.lookup(obj, name) {
            return Some(hit);
        }

        let mut cursor = self.objects.get(obj).props;
        while let Some(pid) = cursor {
            let node = self.props.get(pid.raw());
            if node.name == Some(name) {
                self.lcache.insert(obj, name, pid);
                if let PropertyKind::Data { lcached, .. } = &mut self.props.get_mut(pid.raw()).kind
                {
                    *lcached = true;
                }
                return Some(pid);
            }
            cursor = node.next;
        }
        None
    }

    /// Create a named data property (value starts undefined).
    pub fn create_named_data_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    ) -> OpResult<PropId> {
        debug_assert!(self.find_named_property(obj, name).is_none());
        let pid = self.alloc_prop()?;
        self.strings.ref_string(name);
        let head = self.objects.get(obj).props;
        *self.props.get_mut(pid.raw()) = PropertyNode {
            name: Some(name),
            kind: PropertyKind::Data {
                value: Value::Undefined,
                writable,
                enumerable,
                configurable,
                lcached: false,
            },
            next: head,
        };
        self.objects.get_mut(obj).props = Some(pid);
        Ok(pid)
    }

    pub fn create_named_accessor_property(
        &mut self,
        obj: ObjectId,
        name: StringId,
        get: Option<ObjectId>,
        set: Option<ObjectId>,
        enumerable: bool,
        configurable: bool,
    ) -> OpResult<PropId> {
        let pid = self.alloc_prop()?;
        self.strings.ref_string(name);
        if let Some(getter) = get {
            self.note_object_store(obj, getter);
        }
        if let Some(setter) = set {
            self.note_object_store(obj, setter);
        }
        let head = self.objects.get(obj).props;
        *self.props.get_mut(pid.raw()) = PropertyNode {
            name: Some(name),
            kind: PropertyKind::Accessor { get, set, enumerable, configurable },
            next: head,
        };
        self.objects.get_mut(obj).props = Some(pid);
        Ok(pid)
    }

    /// Value of a named data property.
    pub fn named_data_value(&self, pid: PropId) -> Value {
        match &self.props.get(pid.raw()).kind {
            PropertyKind::Data { value, .. } => *value,
            _ => Value::Undefined,
        }
    }

    /// Assign into a named data property, keeping string counts and the
    /// generational hint coherent.
    pub fn assign_named_data_value(&mut self, obj: ObjectId, pid: PropId, value: Value) {
        let old = self.named_data_value(pid);
        self.ref_stored(value);
        self.free_stored(old);
        self.note_store(obj, value);
        if let PropertyKind::Data { value: slot, .. } = &mut self.props.get_mut(pid.raw()).kind {
            *slot = value;
        }
    }

    /// Unlink and free a property node.
    pub fn delete_property(&mut self, obj: ObjectId, pid: PropId) {
        let mut cursor = self.objects.get(obj).props;
        let mut prev: Option<PropId> = None;
        while let Some(at) = cursor {
            let next = self.props.get(at.raw()).next;
            if at == pid {
                match prev {
                    None => self.objects.get_mut(obj).props = next,
                    Some(p) => self.props.get_mut(p.raw()).next = next,
                }
                break;
            }
            prev = Some(at);
            cursor = next;
        }

        if let Some(name) = self.props.get(pid.raw()).name {
            self.lcache.invalidate(obj, name);
        }
        self.free_property_node(pid);
    }

    /// Release a node's stored references and its slot. Does not touch the
    /// list links; callers unlink (or drop the whole list) themselves.
    pub(crate) fn free_property_node(&mut self, pid: PropId) {
        let node = self.props.get(pid.raw()).clone();
        if let Some(name) = node.name {
            self.strings.deref_string(name);
        }
        match node.kind {
            PropertyKind::Data { value, .. } => self.free_stored(value),
            PropertyKind::Accessor { .. } => {}
            PropertyKind::Internal { slot, payload } => match slot {
                InternalSlot::PrimitiveValue => {
                    let cell = self.objects.cells.get(payload as u16).0;
                    self.free_stored(cell);
                    self.objects.cells.free(payload as u16);
                }
                InternalSlot::FormalParams => {
                    let names = std::mem::take(&mut self.objects.params.get_mut(payload as u16).0);
                    for name in names {
                        self.strings.deref_string(name);
                    }
                    self.objects.params.free(payload as u16);
                }
                _ => {}
            },
        }
        self.props.free(pid.raw());
    }

    // ------------------------------------------------------------------
    // Internal slots
    // ------------------------------------------------------------------

    pub fn internal_slot(&self, obj: ObjectId, slot: InternalSlot) -> Option<u32> {
        let mut cursor = self.objects.get(obj).props;
        while let Some(pid) = cursor {
            let node = self.props.get(pid.raw());
            if let PropertyKind::Internal { slot: s, payload } = node.kind {
                if s == slot {
                    return Some(payload);
                }
            }
            cursor = node.next;
        }
        None
    }

    pub fn set_internal_slot(&mut self, obj: ObjectId, slot: InternalSlot, payload: u32) -> OpResult<()> {
        let mut cursor = self.objects.get(obj).props;
        while let Some(pid) = cursor {
            let node = self.props.get_mut(pid.raw());
            if let PropertyKind::Internal { slot: s, payload: p } = &mut node.kind {
                if *s == slot {
                    *p = payload;
                    return Ok(());
                }
            }
            cursor = self.props.get(pid.raw()).next;
        }

        let pid = self.alloc_prop()?;
        let head = self.objects.get(obj).props;
        *self.props.get_mut(pid.raw()) = PropertyNode {
            name: None,
            kind: PropertyKind::Internal { slot, payload },
            next: head,
        };
        self.objects.get_mut(obj).props = Some(pid);
        Ok(())
    }

    /// Scope slot of a function object, with the generational hint update.
    pub fn set_scope_slot(&mut self, func: ObjectId, scope: ObjectId) -> OpResult<()> {
        self.note_object_store(func, scope);
        self.set_internal_slot(func, InternalSlot::Scope, scope.raw() as u32)
    }

    // ========================================================================
    // Standard errors
    // ========================================================================

    /// Construct a standard error object. The returned value is an owned
    /// reference.
    pub fn new_standard_error(&mut self, kind: ErrorKind) -> OpResult<Value> {
        let proto = self.globals.error_prototypes[kind.index()];
        let obj = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::General),
            Some(proto),
        )?;
        // Rooted before the slot allocation below can trigger a collection.
        self.objects.inc_rc(obj);
        if let Err(abrupt) =
            self.set_internal_slot(obj, InternalSlot::Class, kind.class_magic() as u32)
        {
            self.free_value(Value::Object(obj));
            return Err(abrupt);
        }
        Ok(Value::Object(obj))
    }

    /// Build a throw completion around a fresh standard error.
    pub fn throw_error(&mut self, kind: ErrorKind) -> Abrupt {
        match self.new_standard_error(kind) {
            Ok(value) => Abrupt::Throw(value),
            Err(fatal) => fatal,
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn mem_stats(&self) -> MemStats {
        let mut pools = self.objects.stats();
        pools.merge(&self.props.stats());
        pools.merge(&self.strings.pool_stats());
        MemStats {
            heap: self.strings.heap_stats(),
            pools,
        }
    }

    pub fn reset_stat_peaks(&mut self) {
        self.strings.reset_peak();
        self.objects.reset_peak();
        self.props.reset_peak();
    }

    // ========================================================================
    // Built-in bootstrap
    // ========================================================================

    /// Create the run-wide objects: Object.prototype, the global object and
    /// environment, the error prototypes and constructors, and the minimal
    /// `Object` surface the dispatch contract requires.
    fn init_builtins(&mut self) -> OpResult<()> {
        let object_prototype =
            self.alloc_object(ObjectKind::Ordinary(ObjectType::General), None)?;
        self.set_internal_slot(object_prototype, InternalSlot::Class, MagicStringId::ObjectUl as u32)?;

        let function_prototype =
            self.alloc_object(ObjectKind::Ordinary(ObjectType::General), Some(object_prototype))?;
        self.set_internal_slot(
            function_prototype,
            InternalSlot::Class,
            MagicStringId::FunctionUl as u32,
        )?;

        let global_obj =
            self.alloc_object(ObjectKind::Ordinary(ObjectType::Builtin), Some(object_prototype))?;
        self.objects.get_mut(global_obj).is_builtin = true;
        self.set_internal_slot(global_obj, InternalSlot::Class, MagicStringId::GlobalUl as u32)?;

        // Error.prototype chains to Object.prototype; the specific error
        // prototypes chain to Error.prototype.
        let mut error_prototypes = [object_prototype; ERROR_KIND_COUNT];
        for index in 0..ERROR_KIND_COUNT {
            let kind = ErrorKind::from_index(index).expect("index in range");
            let proto_proto = if kind == ErrorKind::Error {
                object_prototype
            } else {
                error_prototypes[ErrorKind::Error.index()]
            };
            let proto =
                self.alloc_object(ObjectKind::Ordinary(ObjectType::General), Some(proto_proto))?;
            self.set_internal_slot(proto, InternalSlot::Class, MagicStringId::ErrorUl as u32)?;

            let name_prop = self.create_named_data_property(
                proto,
                self.strings.magic(MagicStringId::Name),
                true,
                false,
                true,
            )?;
            self.assign_named_data_value(
                proto,
                name_prop,
                Value::Str(self.strings.magic(kind.class_magic())),
            );
            let msg_prop = self.create_named_data_property(
                proto,
                self.strings.magic(MagicStringId::Message),
                true,
                false,
                true,
            )?;
            self.assign_named_data_value(
                proto,
                msg_prop,
                Value::Str(self.strings.magic(MagicStringId::Empty)),
            );
            error_prototypes[index] = proto;
        }

        self.globals = Globals {
            global_obj,
            global_env: global_obj, // replaced below
            object_prototype,
            function_prototype,
            error_prototypes,
        };

        // Frozen value properties of the global object (ES5 15.1.1).
        for (name, value) in [
            (MagicStringId::Undefined, Value::Undefined),
            (MagicStringId::NaN, Value::Number(f64::NAN)),
            (MagicStringId::Infinity, Value::Number(f64::INFINITY)),
        ] {
            let pid = self.create_named_data_property(
                global_obj,
                self.strings.magic(name),
                false,
                false,
                false,
            )?;
            self.assign_named_data_value(global_obj, pid, value);
        }

        // Error constructors.
        for index in 0..ERROR_KIND_COUNT {
            let kind = ErrorKind::from_index(index).expect("index in range");
            let ctor = self.new_builtin_function(BuiltinRoutine::ErrorConstructor(kind))?;
            self.define_builtin_prototype_link(ctor, error_prototypes[index])?;
            self.define_global_binding(kind.class_magic(), Value::Object(ctor))?;
        }

        // The Object constructor with the defineProperty routine.
        let object_ctor = self.new_builtin_function(BuiltinRoutine::ObjectConstructor)?;
        self.define_builtin_prototype_link(object_ctor, object_prototype)?;
        let define_property = self.new_builtin_function(BuiltinRoutine::ObjectDefineProperty)?;
        {
            let name = self.intern_string("defineProperty")?;
            let pid = self.create_named_data_property(object_ctor, name, true, false, true)?;
            self.assign_named_data_value(object_ctor, pid, Value::Object(define_property));
            self.strings.deref_string(name);
        }
        self.define_global_binding(MagicStringId::ObjectUl, Value::Object(object_ctor))?;

        // The global environment binds the global object (provide-this off).
        let global_env = self.alloc_object(
            ObjectKind::ObjectEnv {
                outer: None,
                bindings: global_obj,
                provide_this: false,
            },
            None,
        )?;
        self.globals.global_env = global_env;

        // The globals struct holds external references for the whole run.
        self.objects.inc_rc(global_obj);
        self.objects.inc_rc(global_env);
        self.objects.inc_rc(object_prototype);
        self.objects.inc_rc(function_prototype);
        for proto in error_prototypes {
            self.objects.inc_rc(proto);
        }
        Ok(())
    }

    fn new_builtin_function(&mut self, routine: BuiltinRoutine) -> OpResult<ObjectId> {
        let func = self.alloc_object(
            ObjectKind::Ordinary(ObjectType::Builtin),
            Some(self.globals.function_prototype),
        )?;
        self.objects.get_mut(func).is_builtin = true;
        self.set_internal_slot(func, InternalSlot::Class, MagicStringId::FunctionUl as u32)?;
        self.set_internal_slot(func, InternalSlot::BuiltinId, routine.encode())?;
        Ok(func)
    }

    /// ctor.prototype <-> proto.constructor, with the standard attributes.
    fn define_builtin_prototype_link(&mut self, ctor: ObjectId, proto: ObjectId) -> OpResult<()> {
        let prototype_name = self.strings.magic(MagicStringId::Prototype);
        let pid = self.create_named_data_property(ctor, prototype_name, false, false, false)?;
        self.assign_named_data_value(ctor, pid, Value::Object(proto));

        let ctor_name = self.strings.magic(MagicStringId::Constructor);
        let pid = self.create_named_data_property(proto, ctor_name, true, false, true)?;
        self.assign_named_data_value(proto, pid, Value::Object(ctor));
        Ok(())
    }

    fn define_global_binding(&mut self, name: MagicStringId, value: Value) -> OpResult<()> {
        let name = self.strings.magic(name);
        let global = self.globals.global_obj;
        let pid = self.create_named_data_property(global, name, true, false, true)?;
        self.assign_named_data_value(global, pid, value);
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Drop the run-wide references and collect everything reclaimable.
    pub fn teardown(&mut self) {
        let roots = std::mem::take(&mut self.strong_roots);
        for value in roots {
            self.free_value(value);
        }
        self.objects.dec_rc(self.globals.global_obj);
        self.objects.dec_rc(self.globals.global_env);
        self.objects.dec_rc(self.globals.object_prototype);
        self.objects.dec_rc(self.globals.function_prototype);
        for index in 0..ERROR_KIND_COUNT {
            self.objects.dec_rc(self.globals.error_prototypes[index]);
        }
        self.try_give_memory_back(GcSeverity::Critical);
    }
}
