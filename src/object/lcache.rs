//! LCache: the property-lookup cache.
//!
//! A direct-mapped table of (object, name) → property-node lines that
//! short-circuits repeated lookups. Every structural mutation of a property
//! list must invalidate the affected lines; memory pressure drops the whole
//! table (it is the first stage of the allocation recovery cascade).

use crate::object::{ObjectId, PropId};
use crate::strings::StringId;

const LINES: usize = 128;

#[derive(Debug, Clone, Copy)]
struct Line {
    object: ObjectId,
    name: StringId,
    prop: PropId,
}

pub struct LCache {
    lines: [Option<Line>; LINES],
    pub hits: u64,
    pub misses: u64,
}

impl LCache {
    pub fn new() -> Self {
        LCache {
            lines: [None; LINES],
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn index(object: ObjectId, name: StringId) -> usize {
        // Cheap avalanche over the two 16-bit handles; same shape as the
        // fx-hash multiply.
        let key = ((object.raw() as u32) << 16) | name_bits(name);
        (key.wrapping_mul(0x9E37_79B9) >> 24) as usize % LINES
    }

    pub fn lookup(&mut self, object: ObjectId, name: StringId) -> Option<PropId> {
        let line = self.lines[Self::index(object, name)]?;
        if line.object == object && line.name == name {
            self.hits += 1;
            Some(line.prop)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn insert(&mut self, object: ObjectId, name: StringId, prop: PropId) {
        self.lines[Self::index(object, name)] = Some(Line { object, name, prop });
    }

    /// Drop the line for one (object, name) pair.
    pub fn invalidate(&mut self, object: ObjectId, name: StringId) {
        let at = Self::index(object, name);
        if let Some(line) = self.lines[at] {
            if line.object == object && line.name == name {
                self.lines[at] = None;
            }
        }
    }

    /// Drop every line referring to `object` (deletion, prototype change,
    /// object death).
    pub fn invalidate_object(&mut self, object: ObjectId) {
        for line in self.lines.iter_mut() {
            if line.map(|l| l.object) == Some(object) {
                *line = None;
            }
        }
    }

    /// Drop everything. First stage of the allocation recovery cascade.
    pub fn drop_all(&mut self) {
        self.lines = [None; LINES];
    }
}

impl Default for LCache {
    fn default() -> Self {
        Self::new()
    }
}

fn name_bits(name: StringId) -> u32 {
    // StringId is opaque outside strings.rs; hashing through the Hash impl
    // would defeat the point of a direct-mapped table.
    let mut h = rustc_hash::FxHasher::default();
    std::hash::Hash::hash(&name, &mut h);
    std::hash::Hasher::finish(&h) as u32 & 0xFFFF
}
