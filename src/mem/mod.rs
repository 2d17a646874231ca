//! Memory substrate: compressed pointers, the byte heap and the slot pools.
//!
//! Every persistent cross-record reference in the engine is a 16-bit
//! [`CompressedPtr`] into one of the arenas; native references exist only
//! transiently on the Rust stack. The zero encoding is reserved for null,
//! which is why the inner type is `NonZeroU16` and nullable links are spelled
//! `Option<CompressedPtr>` at zero representation cost.

mod heap;
mod pool;

pub use heap::{Heap, HeapStats};
pub use pool::{PoolStats, Reset, SlotPool};

use std::num::NonZeroU16;

/// 16-bit handle into an arena. Zero denotes null and is unrepresentable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressedPtr(NonZeroU16);

impl CompressedPtr {
    /// Pack a raw arena index. Returns `None` for the null encoding.
    #[inline]
    pub fn pack(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(CompressedPtr)
    }

    /// Unpack to the raw arena index.
    #[inline]
    pub fn unpack(self) -> u16 {
        self.0.get()
    }
}

impl std::fmt::Debug for CompressedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cp:{}", self.0.get())
    }
}

/// How urgently the allocator needs memory back.
///
/// `Low` runs a minor collection over the young partition; `Critical` runs a
/// major collection and additionally returns entirely-free pool pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSeverity {
    Low,
    Critical,
}

/// Combined snapshot of heap and pool statistics.
#[derive(Debug, Clone, Default)]
pub struct MemStats {
    pub heap: HeapStats,
    pub pools: PoolStats,
}
