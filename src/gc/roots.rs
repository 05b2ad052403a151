//! Bounded buffer of possible cycle roots

use crate::gc::trace::CellPtr;
use static_assertions::const_assert;
use std::mem;

/// Capacity of the root buffer. Reaching it forces a synchronous collection.
pub const MAX_ROOTS: usize = 1024;

// Slot indices must stay addressable with pointer-sized arithmetic.
const_assert!(MAX_ROOTS <= isize::MAX as usize);

/// Insertion-ordered buffer of candidate roots.
///
/// Removal swaps the last slot into the vacated position, so slot order is
/// not stable across a collection. Capacity is reserved up front and kept
/// across drains; mutator-context insertions never allocate.
pub(crate) struct Roots {
    slots: Vec<CellPtr>,
}

impl Roots {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_ROOTS),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_ROOTS
    }

    /// Append a candidate.
    ///
    /// Destructors cascading inside a collection may push past the bound;
    /// the next mutator-context insertion tops the buffer up and flushes
    /// the whole backlog in one pass.
    #[inline]
    pub fn push(&mut self, cell: CellPtr) {
        self.slots.push(cell);
    }

    #[inline]
    pub fn get(&self, index: usize) -> CellPtr {
        self.slots[index]
    }

    /// Remove the slot at `index` by swapping the last slot into it.
    pub fn swap_remove(&mut self, index: usize) -> CellPtr {
        self.slots.swap_remove(index)
    }

    /// Take the whole candidate set, leaving an empty buffer with its
    /// capacity still reserved.
    pub fn take_all(&mut self) -> Vec<CellPtr> {
        mem::replace(&mut self.slots, Vec::with_capacity(MAX_ROOTS))
    }

    /// Repoint the slot holding `old` after its block moved in memory.
    pub fn rewrite(&mut self, old: *const u8, new: CellPtr) {
        for slot in &mut self.slots {
            if slot.cast::<u8>().as_ptr() as *const u8 == old {
                *slot = new;
                return;
            }
        }
        debug_assert!(false, "moved block was not in the root buffer");
    }
}
