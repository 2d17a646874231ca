//! Mark-and-sweep garbage collection over the object arena.
//!
//! Roots are the objects with a positive external refcount: the globals, the
//! active frames' registers and bindings, API strong roots, and transient
//! handler copies. Graph edges (property values, prototypes, internal slots,
//! environment links) are traced, not counted, so cycles collect.
//!
//! Each record carries a generation bit and a may-reference-younger hint. A
//! minor collection (severity `Low`) walks roots but descends only through
//! young objects and hinted tenured ones, then sweeps unmarked young
//! objects; a major collection (severity `Critical`) walks and sweeps
//! everything and additionally returns free pool pages.
//!
//! Strings are refcounted descriptors and are never swept here; collecting
//! an object merely drops the references its properties held.

use crate::context::Context;
use crate::mem::GcSeverity;
use crate::object::{ObjectId, ObjectKind, PropertyKind};
use crate::object::property::InternalSlot;
use crate::value::Value;

impl Context {
    /// The "give memory back" entry point: first recovery stage drops the
    /// lookup cache, then a collection runs, and critical pressure also
    /// returns entirely-free pool pages.
    pub fn try_give_memory_back(&mut self, severity: GcSeverity) {
        self.lcache.drop_all();
        self.collect_garbage(severity);
        if severity == GcSeverity::Critical {
            self.objects.shrink();
            self.props.shrink();
            self.strings.shrink();
        }
    }

    /// Run one stop-the-world collection.
    pub fn collect_garbage(&mut self, severity: GcSeverity) {
        let minor = severity == GcSeverity::Low;

        let live: Vec<ObjectId> = self.objects.iter_ids().collect();
        for &id in &live {
            self.objects.get_mut(id).marked = false;
        }

        // Roots: every externally referenced object, plus - for a minor
        // collection - every hinted tenured object, reachable or not. The
        // hint set must over-approximate reachability into the young
        // partition; unreachable hinted objects are floating garbage until
        // the next major collection.
        let mut worklist: Vec<ObjectId> = Vec::new();
        for &id in &live {
            let record = self.objects.get(id);
            if record.rc > 0 || (minor && !record.young && record.may_ref_young) {
                worklist.push(id);
            }
        }

        while let Some(id) = worklist.pop() {
            let record = self.objects.get_mut(id);
            if record.marked {
                continue;
            }
            record.marked = true;

            // In a minor collection an unhinted tenured object cannot
            // reference the young partition; treat it as a leaf.
            if minor && !record.young && !record.may_ref_young {
                continue;
            }
            self.push_object_edges(id, &mut worklist);
        }

        for &id in &live {
            let record = self.objects.get(id);
            if record.marked {
                continue;
            }
            if minor && !record.young {
                continue;
            }
            self.free_object(id);
        }

        // Survivors of this cycle are tenured.
        for &id in &live {
            let record = self.objects.get_mut(id);
            if record.marked {
                record.young = false;
            }
        }
    }

    /// Type-specific visitor: push every object this record references.
    fn push_object_edges(&self, id: ObjectId, out: &mut Vec<ObjectId>) {
        let record = self.objects.get(id);
        if let Some(proto) = record.prototype {
            out.push(proto);
        }
        match record.kind {
            ObjectKind::Ordinary(_) => {}
            ObjectKind::DeclEnv { outer } => out.extend(outer),
            ObjectKind::ObjectEnv { outer, bindings, .. } => {
                out.extend(outer);
                out.push(bindings);
            }
        }

        let mut cursor = record.props;
        while let Some(pid) = cursor {
            let node = self.props.get(pid.raw());
            match &node.kind {
                PropertyKind::Data { value, .. } => {
                    if let Value::Object(target) = value {
                        out.push(*target);
                    }
                }
                PropertyKind::Accessor { get, set, .. } => {
                    out.extend(*get);
                    out.extend(*set);
                }
                PropertyKind::Internal { slot, payload } => match slot {
                    InternalSlot::Scope => {
                        out.extend(ObjectId::from_raw(*payload as u16));
                    }
                    InternalSlot::PrimitiveValue => {
                        if let Value::Object(target) = self.objects.cells.get(*payload as u16).0 {
                            out.push(target);
                        }
                    }
                    _ => {}
                },
            }
            cursor = node.next;
        }
    }

    /// Free a dead object: release the property list and the record slot.
    /// Object-valued contents are graph references, so no cascade happens
    /// here; strings lose one count per owning descriptor.
    pub(crate) fn free_object(&mut self, id: ObjectId) {
        self.lcache.invalidate_object(id);
        let mut cursor = self.objects.get_mut(id).props.take();
        while let Some(pid) = cursor {
            cursor = self.props.get(pid.raw()).next;
            self.free_property_node(pid);
        }
        self.objects.free(id);
    }
}
