//! Per-cell bookkeeping: reference count, trial-deletion color, flags
//!
//! Every managed cell starts with an [`ObjectHeader`]. The header also
//! carries a backlink to the owning [`Heap`] so release and candidate
//! buffering never depend on ambient state.

use crate::gc::Heap;
use std::cell::Cell;

/// Reference count of a managed cell.
///
/// Immortal cells opt out of lifetime tracking entirely: retain and release
/// are no-ops on them and the collector never traces through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCount {
    /// Live cell with an exact owner count
    Owned(usize),
    /// Permanent cell, never destroyed
    Immortal,
}

impl RefCount {
    #[inline]
    pub fn is_immortal(self) -> bool {
        matches!(self, RefCount::Immortal)
    }
}

/// Trial-deletion color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// In use, or newly allocated
    Black,
    /// Visited during the mark phase, counts speculatively removed
    Gray,
    /// Member of a garbage cycle
    White,
    /// Possible root of a cycle
    Purple,
    /// Immortal, never enters a collection phase
    Green,
}

/// Header shared by every managed cell.
///
/// Mutation goes through `Cell`, which also keeps every cell type `!Send`
/// and `!Sync`: one heap belongs to one thread.
pub struct ObjectHeader {
    count: Cell<RefCount>,
    color: Cell<Color>,
    buffered: Cell<bool>,
    destroyed: Cell<bool>,
    heap: Heap,
}

impl ObjectHeader {
    pub(crate) fn new(heap: Heap) -> Self {
        Self {
            count: Cell::new(RefCount::Owned(1)),
            color: Cell::new(Color::Black),
            buffered: Cell::new(false),
            destroyed: Cell::new(false),
            heap,
        }
    }

    pub(crate) fn new_immortal(heap: Heap) -> Self {
        Self {
            count: Cell::new(RefCount::Immortal),
            color: Cell::new(Color::Green),
            buffered: Cell::new(false),
            destroyed: Cell::new(false),
            heap,
        }
    }

    #[inline(always)]
    pub fn refcount(&self) -> RefCount {
        self.count.get()
    }

    #[inline(always)]
    pub fn is_immortal(&self) -> bool {
        self.count.get().is_immortal()
    }

    /// Owner count of a mortal cell.
    ///
    /// Immortal cells never reach the call sites; if one does, the sentinel
    /// keeps the collector conservative (a huge count is never freed).
    #[inline(always)]
    pub(crate) fn rc(&self) -> usize {
        match self.count.get() {
            RefCount::Owned(n) => n,
            RefCount::Immortal => {
                debug_assert!(false, "owner count read on immortal cell");
                usize::MAX
            }
        }
    }

    /// Raw count increment, no recoloring. Collector phases only.
    #[inline(always)]
    pub(crate) fn inc(&self) {
        match self.count.get() {
            RefCount::Owned(n) => {
                debug_assert!(n < usize::MAX, "refcount overflow in collector phase");
                self.count.set(RefCount::Owned(n + 1));
            }
            RefCount::Immortal => debug_assert!(false, "raw increment of immortal cell"),
        }
    }

    /// Raw count decrement, no recoloring. Collector phases only.
    #[inline(always)]
    pub(crate) fn dec(&self) {
        match self.count.get() {
            RefCount::Owned(n) => {
                debug_assert!(n > 0, "refcount underflow in collector phase");
                self.count.set(RefCount::Owned(n.saturating_sub(1)));
            }
            RefCount::Immortal => debug_assert!(false, "raw decrement of immortal cell"),
        }
    }

    pub(crate) fn set_refcount(&self, count: RefCount) {
        self.count.set(count);
    }

    #[inline(always)]
    pub fn color(&self) -> Color {
        self.color.get()
    }

    #[inline(always)]
    pub(crate) fn set_color(&self, color: Color) {
        self.color.set(color);
    }

    #[inline(always)]
    pub fn buffered(&self) -> bool {
        self.buffered.get()
    }

    #[inline(always)]
    pub(crate) fn set_buffered(&self, buffered: bool) {
        self.buffered.set(buffered);
    }

    /// Whether the cell's payload has already been destroyed.
    ///
    /// A destroyed cell may still be reachable from the root buffer while
    /// its memory release is deferred.
    #[inline(always)]
    pub fn destroyed(&self) -> bool {
        self.destroyed.get()
    }

    #[inline(always)]
    pub(crate) fn set_destroyed(&self) {
        self.destroyed.set(true);
    }

    #[inline(always)]
    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }
}
