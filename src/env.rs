//! Lexical environments (ES5 10.2).
//!
//! Environment records are arena objects: a declarative record keeps its
//! bindings in its own property list (a mutable binding is a writable data
//! property, an immutable one is non-writable, and an uninitialised
//! immutable binding holds the `Empty` sentinel); an object-bound record
//! delegates to its binding object. The outer chain is a compressed handle
//! walk.

use crate::context::{Context, ErrorKind};
use crate::object::{ObjectId, ObjectKind, PropertyDescriptor, PropertyKind};
use crate::strings::StringId;
use crate::value::{Abrupt, FatalKind, OpResult, Value};

/// Which flavor an environment record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvKind {
    Declarative,
    ObjectBound { bindings: ObjectId, provide_this: bool },
}

impl Context {
    pub fn create_decl_env(&mut self, outer: Option<ObjectId>) -> OpResult<ObjectId> {
        self.alloc_object(ObjectKind::DeclEnv { outer }, None)
    }

    pub fn create_object_env(
        &mut self,
        outer: Option<ObjectId>,
        bindings: ObjectId,
        provide_this: bool,
    ) -> OpResult<ObjectId> {
        let env = self.alloc_object(
            ObjectKind::ObjectEnv { outer, bindings, provide_this },
            None,
        )?;
        self.note_object_store(env, bindings);
        Ok(env)
    }

    pub fn env_outer(&self, env: ObjectId) -> Option<ObjectId> {
        match self.objects.get(env).kind {
            ObjectKind::DeclEnv { outer } => outer,
            ObjectKind::ObjectEnv { outer, .. } => outer,
            ObjectKind::Ordinary(_) => None,
        }
    }

    fn env_kind(&self, env: ObjectId) -> OpResult<EnvKind> {
        match self.objects.get(env).kind {
            ObjectKind::DeclEnv { .. } => Ok(EnvKind::Declarative),
            ObjectKind::ObjectEnv { bindings, provide_this, .. } => {
                Ok(EnvKind::ObjectBound { bindings, provide_this })
            }
            ObjectKind::Ordinary(_) => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "ordinary object used as a lexical environment",
            ))),
        }
    }

    /// HasBinding (10.2.1.1.1 / 10.2.1.2.1).
    pub fn op_has_binding(&mut self, env: ObjectId, name: StringId) -> OpResult<bool> {
        match self.env_kind(env)? {
            EnvKind::Declarative => Ok(self.find_named_property(env, name).is_some()),
            EnvKind::ObjectBound { bindings, .. } => self.op_object_has_property(bindings, name),
        }
    }

    /// CreateMutableBinding (10.2.1.1.2 / 10.2.1.2.2).
    pub fn op_create_mutable_binding(
        &mut self,
        env: ObjectId,
        name: StringId,
        is_deletable: bool,
    ) -> OpResult<()> {
        match self.env_kind(env)? {
            EnvKind::Declarative => {
                self.create_named_data_property(env, name, true, false, is_deletable)?;
                Ok(())
            }
            EnvKind::ObjectBound { bindings, .. } => {
                let desc = PropertyDescriptor {
                    value: Some(Value::Undefined),
                    writable: Some(true),
                    enumerable: Some(true),
                    configurable: Some(is_deletable),
                    ..PropertyDescriptor::default()
                };
                self.op_object_define_own_property(bindings, name, &desc, true)?;
                Ok(())
            }
        }
    }

    /// SetMutableBinding (10.2.1.1.3 / 10.2.1.2.3).
    pub fn op_set_mutable_binding(
        &mut self,
        env: ObjectId,
        name: StringId,
        value: Value,
        strict: bool,
    ) -> OpResult<()> {
        match self.env_kind(env)? {
            EnvKind::Declarative => {
                let pid = self.find_named_property(env, name).ok_or(Abrupt::Fatal(
                    FatalKind::InvalidImage("SetMutableBinding without a binding"),
                ))?;
                let writable = match self.props.get(pid.raw()).kind {
                    PropertyKind::Data { writable, .. } => writable,
                    _ => false,
                };
                if writable {
                    self.assign_named_data_value(env, pid, value);
                    Ok(())
                } else if strict {
                    Err(self.throw_error(ErrorKind::Type))
                } else {
                    Ok(())
                }
            }
            EnvKind::ObjectBound { bindings, .. } => {
                self.op_object_put(bindings, name, value, strict)?;
                Ok(())
            }
        }
    }

    /// GetBindingValue (10.2.1.1.4 / 10.2.1.2.4). Returns an owned value.
    pub fn op_get_binding_value(
        &mut self,
        env: ObjectId,
        name: StringId,
        strict: bool,
    ) -> OpResult<Value> {
        match self.env_kind(env)? {
            EnvKind::Declarative => {
                let pid = self.find_named_property(env, name).ok_or(Abrupt::Fatal(
                    FatalKind::InvalidImage("GetBindingValue without a binding"),
                ))?;
                let node = self.props.get(pid.raw());
                let (value, writable) = match node.kind {
                    PropertyKind::Data { value, writable, .. } => (value, writable),
                    _ => {
                        return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                            "environment binding is not a data property",
                        )))
                    }
                };
                // An uninitialised immutable binding reads as a
                // ReferenceError in strict code, undefined otherwise.
                if !writable && value.is_empty() {
                    return if strict {
                        Err(self.throw_error(ErrorKind::Reference))
                    } else {
                        Ok(Value::Undefined)
                    };
                }
                self.ref_value(value);
                Ok(value)
            }
            EnvKind::ObjectBound { bindings, .. } => {
                if !self.op_object_has_property(bindings, name)? {
                    return if strict {
                        Err(self.throw_error(ErrorKind::Reference))
                    } else {
                        Ok(Value::Undefined)
                    };
                }
                self.op_object_get(bindings, name)
            }
        }
    }

    /// DeleteBinding (10.2.1.1.5 / 10.2.1.2.5).
    pub fn op_delete_binding(&mut self, env: ObjectId, name: StringId) -> OpResult<bool> {
        match self.env_kind(env)? {
            EnvKind::Declarative => match self.find_named_property(env, name) {
                None => Ok(true),
                Some(pid) => {
                    if !self.props.get(pid.raw()).is_configurable() {
                        Ok(false)
                    } else {
                        self.delete_property(env, pid);
                        Ok(true)
                    }
                }
            },
            EnvKind::ObjectBound { bindings, .. } => {
                self.op_object_delete(bindings, name, false)
            }
        }
    }

    /// ImplicitThisValue (10.2.1.1.6 / 10.2.1.2.6). Returns an owned value.
    pub fn op_implicit_this_value(&mut self, env: ObjectId) -> OpResult<Value> {
        match self.env_kind(env)? {
            EnvKind::Declarative => Ok(Value::Undefined),
            EnvKind::ObjectBound { bindings, provide_this } => {
                if provide_this {
                    self.objects.inc_rc(bindings);
                    Ok(Value::Object(bindings))
                } else {
                    Ok(Value::Undefined)
                }
            }
        }
    }

    /// CreateImmutableBinding (10.2.1.1.7): a non-writable data property
    /// holding the uninitialised sentinel.
    pub fn op_create_immutable_binding(
        &mut self,
        env: ObjectId,
        name: StringId,
    ) -> OpResult<()> {
        debug_assert!(matches!(
            self.objects.get(env).kind,
            ObjectKind::DeclEnv { .. }
        ));
        let pid = self.create_named_data_property(env, name, false, false, false)?;
        if let PropertyKind::Data { value, .. } = &mut self.props.get_mut(pid.raw()).kind {
            *value = Value::Empty;
        }
        Ok(())
    }

    /// InitializeImmutableBinding (10.2.1.1.8).
    pub fn op_initialize_immutable_binding(
        &mut self,
        env: ObjectId,
        name: StringId,
        value: Value,
    ) -> OpResult<()> {
        let pid = self.find_named_property(env, name).ok_or(Abrupt::Fatal(
            FatalKind::InvalidImage("InitializeImmutableBinding without a binding"),
        ))?;
        debug_assert!(self.named_data_value(pid).is_empty());
        self.assign_named_data_value(env, pid, value);
        Ok(())
    }

    /// Identifier resolution (10.2.2.1): walk the chain for the first record
    /// that has the binding. `None` means unresolvable.
    pub fn resolve_reference_base(
        &mut self,
        env: ObjectId,
        name: StringId,
    ) -> OpResult<Option<ObjectId>> {
        let mut at = Some(env);
        while let Some(current) = at {
            if self.op_has_binding(current, name)? {
                return Ok(Some(current));
            }
            at = self.env_outer(current);
        }
        Ok(None)
    }
}
