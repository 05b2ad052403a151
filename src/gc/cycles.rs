//! Synchronous trial deletion over the buffered candidates
//!
//! Design:
//! 1. Mark: keep live purple candidates and gray their subgraphs, removing
//!    the counts contributed by internal references; everything else leaves
//!    the buffer, freeing cells whose memory release was deferred
//! 2. Scan: subgraphs still holding external references are re-blackened
//!    and their counts restored; the rest turn white
//! 3. Collect: white cells are quarantined, balanced against the counts
//!    removed during the mark step, destroyed, and freed
//!
//! A pass never runs reentrantly. Release cascades inside the collect step
//! buffer fresh candidates for the next pass instead.

use crate::gc::handle::free_block;
use crate::gc::header::Color;
use crate::gc::trace::{CellPtr, Collectible};
use crate::gc::{CollectStats, Heap};
use crate::logging::{log_gc_complete, log_gc_mark, log_gc_start, log_gc_sweep};
use std::mem;
use std::ptr::NonNull;
use std::time::Instant;

impl Heap {
    /// Run one synchronous collection pass over this heap's candidates.
    ///
    /// Returns empty stats when the buffer holds no candidates or when
    /// called from inside a running pass.
    pub fn collect_cycles(&self) -> CollectStats {
        if self.inner.collecting.get() || self.inner.roots.borrow().is_empty() {
            return CollectStats::default();
        }
        self.inner.collecting.set(true);
        let start = Instant::now();
        log_gc_start(self.inner.roots.borrow().len());

        let acyclic = self.mark_roots();
        self.scan_roots();
        let cyclic = self.collect_roots();

        self.inner
            .collections_run
            .set(self.inner.collections_run.get() + 1);
        self.inner
            .freed_acyclic
            .set(self.inner.freed_acyclic.get() + acyclic);
        self.inner
            .freed_cyclic
            .set(self.inner.freed_cyclic.get() + cyclic);
        self.inner.collecting.set(false);

        log_gc_complete(start.elapsed().as_micros() as u64, acyclic, cyclic);
        CollectStats { acyclic, cyclic }
    }

    /// Mark step: filter the buffer down to purple candidates and gray
    /// their subgraphs.
    fn mark_roots(&self) -> usize {
        let mut freed = 0;
        let mut roots = self.inner.roots.borrow_mut();
        let mut index = 0;
        while index < roots.len() {
            let cell = roots.get(index);
            let header = unsafe { cell.as_ref() }.header();
            if header.color() == Color::Purple {
                mark_gray(unsafe { cell.as_ref() });
                index += 1;
                continue;
            }
            // No longer a candidate. Cells that ran their destructor while
            // buffered still own their block; free it now.
            header.set_buffered(false);
            let deferred_free = header.color() == Color::Black && header.rc() == 0;
            roots.swap_remove(index);
            if deferred_free {
                debug_assert!(header.destroyed());
                unsafe { free_block(cell) };
                freed += 1;
            }
        }
        log_gc_mark(roots.len(), freed);
        freed
    }

    /// Scan step: decide survival for every grayed subgraph.
    fn scan_roots(&self) {
        let roots = self.inner.roots.borrow();
        for index in 0..roots.len() {
            scan(unsafe { roots.get(index).as_ref() });
        }
    }

    /// Collect step: gather the white subgraphs and destroy them.
    fn collect_roots(&self) -> usize {
        let drained = self.inner.roots.borrow_mut().take_all();
        for cell in &drained {
            unsafe { cell.as_ref() }.header().set_buffered(false);
        }
        let mut white: Vec<CellPtr> = Vec::with_capacity(drained.len());
        for cell in drained {
            unsafe { collect_white(cell, &mut white) };
        }
        if white.is_empty() {
            return 0;
        }
        // Quarantine. From here on, releases aimed at members are no-ops
        // and retains fault.
        for cell in &white {
            unsafe { cell.as_ref() }.header().set_destroyed();
        }
        // Children that survive the cycle kept their mark-step decrement;
        // put it back so the destructor cascade nets out exactly.
        for cell in &white {
            unsafe { cell.as_ref() }.trace_children(&mut |child: &dyn Collectible| {
                let header = child.header();
                if !header.is_immortal() && !header.destroyed() {
                    header.inc();
                }
            });
        }
        for cell in &white {
            unsafe { cell.as_ref().drop_payload() };
            self.note_destroyed();
        }
        for cell in &white {
            unsafe { free_block(*cell) };
        }
        log_gc_sweep(white.len());
        white.len()
    }
}

/// Gray `cell`'s subgraph, removing the counts internal references
/// contribute. Immortal and destroyed children are left untouched.
fn mark_gray(cell: &dyn Collectible) {
    if cell.header().color() == Color::Gray {
        return;
    }
    cell.header().set_color(Color::Gray);
    cell.trace_children(&mut |child: &dyn Collectible| {
        let header = child.header();
        if header.is_immortal() || header.destroyed() {
            return;
        }
        header.dec();
        mark_gray(child);
    });
}

/// Whiten a gray subgraph with no remaining external references, or hand
/// it to [`scan_black`] when one is found.
fn scan(cell: &dyn Collectible) {
    let header = cell.header();
    if header.color() != Color::Gray {
        return;
    }
    if header.rc() > 0 {
        scan_black(cell);
        return;
    }
    header.set_color(Color::White);
    cell.trace_children(&mut |child: &dyn Collectible| {
        let child_header = child.header();
        if child_header.color() == Color::Gray && !child_header.destroyed() {
            scan(child);
        }
    });
}

/// Re-blacken a surviving subgraph, restoring the counts the mark step
/// removed along the way.
fn scan_black(cell: &dyn Collectible) {
    cell.header().set_color(Color::Black);
    cell.trace_children(&mut |child: &dyn Collectible| {
        let header = child.header();
        if header.is_immortal() || header.destroyed() {
            return;
        }
        header.inc();
        if header.color() != Color::Black {
            scan_black(child);
        }
    });
}

/// Gather the white subgraph reachable from `cell`, marking members black
/// so each is taken exactly once.
unsafe fn collect_white(cell: CellPtr, white: &mut Vec<CellPtr>) {
    let cell_ref = cell.as_ref();
    let header = cell_ref.header();
    if header.color() != Color::White || header.buffered() {
        return;
    }
    header.set_color(Color::Black);
    white.push(cell);
    cell_ref.trace_children(&mut |child: &dyn Collectible| {
        if !child.header().destroyed() {
            // Children arrive as visit-scoped borrows; the blocks behind
            // them stay allocated until the free step takes them.
            let child = mem::transmute::<
                *const (dyn Collectible + '_),
                *mut (dyn Collectible + 'static),
            >(child);
            collect_white(NonNull::new_unchecked(child), white);
        }
    });
}
