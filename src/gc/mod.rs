//! Cycle-aware reference counting
//!
//! Design:
//! 1. Every managed cell is reference counted; the final release destroys it
//! 2. A release that leaves the count above zero buffers the cell as a
//!    possible cycle root
//! 3. The root buffer is bounded; filling it forces a synchronous
//!    trial-deletion pass over the buffered candidates
//! 4. Immortal cells opt out of the whole lifecycle
//! 5. One heap per thread by default, with private heaps available for
//!    isolation; every cell backlinks its heap

mod cycles;
mod handle;
mod header;
mod roots;
mod trace;

#[cfg(test)]
mod tests;

pub use handle::Handle;
pub use header::{Color, ObjectHeader, RefCount};
pub use roots::MAX_ROOTS;
pub use trace::{Collectible, Trace, TracerFn};

pub(crate) use handle::{release, retain};
pub(crate) use trace::CellPtr;

use crate::logging::debug;
use roots::Roots;
use static_assertions::assert_not_impl_any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Aggregate statistics for one heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Cells whose payload is currently alive, immortals included
    pub live_objects: usize,
    /// Cumulative cells allocated
    pub objects_allocated: usize,
    /// Collection passes run
    pub collections_run: usize,
    /// Deferred acyclic cells freed while walking roots
    pub freed_acyclic: usize,
    /// Cells freed as members of garbage cycles
    pub freed_cyclic: usize,
}

/// Result of a single collection pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStats {
    /// Deferred acyclic cells freed while walking roots
    pub acyclic: usize,
    /// Cells freed as members of garbage cycles
    pub cyclic: usize,
}

impl CollectStats {
    pub fn total(&self) -> usize {
        self.acyclic + self.cyclic
    }
}

pub(crate) struct HeapInner {
    roots: RefCell<Roots>,
    collecting: Cell<bool>,
    live_objects: Cell<usize>,
    objects_allocated: Cell<usize>,
    collections_run: Cell<usize>,
    freed_acyclic: Cell<usize>,
    freed_cyclic: Cell<usize>,
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        // Buffered cells hold a heap backlink, so the buffer must already be
        // empty by the time the last reference goes away.
        debug_assert!(
            self.roots.get_mut().is_empty(),
            "heap dropped with buffered candidates"
        );
    }
}

/// A single-threaded managed heap: allocation context plus cycle collector.
///
/// Cloning is cheap and shares the underlying heap. Every cell backlinks
/// its heap, so a heap always outlives the cells allocated in it.
#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

assert_not_impl_any!(Heap: Send, Sync);

thread_local! {
    static CURRENT_HEAP: Heap = Heap::new();
}

impl Heap {
    pub fn new() -> Self {
        debug!(event = "heap_new", "Created heap");
        Self {
            inner: Rc::new(HeapInner {
                roots: RefCell::new(Roots::new()),
                collecting: Cell::new(false),
                live_objects: Cell::new(0),
                objects_allocated: Cell::new(0),
                collections_run: Cell::new(0),
                freed_acyclic: Cell::new(0),
                freed_cyclic: Cell::new(0),
            }),
        }
    }

    /// The calling thread's default heap.
    pub fn current() -> Self {
        CURRENT_HEAP.with(Self::clone)
    }

    /// Whether two handles refer to the same heap.
    pub fn ptr_eq(&self, other: &Heap) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of currently buffered cycle candidates.
    pub fn root_count(&self) -> usize {
        self.inner.roots.borrow().len()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.inner.live_objects.get(),
            objects_allocated: self.inner.objects_allocated.get(),
            collections_run: self.inner.collections_run.get(),
            freed_acyclic: self.inner.freed_acyclic.get(),
            freed_cyclic: self.inner.freed_cyclic.get(),
        }
    }

    /// Buffer `cell` as a possible cycle root, running a pass once the
    /// insertion fills the buffer.
    ///
    /// The cell goes in before the pass runs. A pass frees unbuffered
    /// cells it reaches through garbage, so collecting first would free
    /// the candidate this call still points at.
    pub(crate) fn possible_root(&self, cell: CellPtr) {
        {
            let mut roots = self.inner.roots.borrow_mut();
            let header = unsafe { cell.as_ref() }.header();
            if header.buffered() {
                return;
            }
            header.set_buffered(true);
            roots.push(cell);
            if !roots.is_full() {
                return;
            }
        }
        self.collect_cycles();
    }

    /// Repoint the root slot of a buffered block after it moved in memory.
    pub(crate) fn rewrite_root(&self, old: *const u8, new: CellPtr) {
        self.inner.roots.borrow_mut().rewrite(old, new);
    }

    pub(crate) fn note_allocated(&self) {
        self.inner.live_objects.set(self.inner.live_objects.get() + 1);
        self.inner
            .objects_allocated
            .set(self.inner.objects_allocated.get() + 1);
    }

    pub(crate) fn note_destroyed(&self) {
        let live = self.inner.live_objects.get();
        debug_assert!(live > 0, "destroyed more cells than were allocated");
        self.inner.live_objects.set(live.saturating_sub(1));
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a synchronous collection on the calling thread's heap.
pub fn collect_cycles() -> CollectStats {
    Heap::current().collect_cycles()
}
