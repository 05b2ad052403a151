//! Block allocation with collect-and-retry
//!
//! Design:
//! - Managed blocks come straight from the global allocator
//! - A refused allocation runs one synchronous collection pass on the
//!   requesting heap, then retries once; a second refusal is a fatal fault
//! - Layout math is centralized and overflow-checked in [`block`]

pub(crate) mod block;


use crate::fault::oom_fault;
use crate::gc::Heap;
use crate::logging::{log_allocation, log_deallocation, log_oom_retry, trace};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Allocate a block, collecting cycles and retrying once if the allocator
/// refuses. A second refusal aborts.
pub fn alloc_or_collect(heap: &Heap, layout: Layout) -> NonNull<u8> {
    debug_assert!(layout.size() > 0, "zero-size managed block");
    if let Some(ptr) = NonNull::new(unsafe { std::alloc::alloc(layout) }) {
        log_allocation(layout.size(), ptr.as_ptr());
        return ptr;
    }
    log_oom_retry(layout.size());
    heap.collect_cycles();
    if let Some(ptr) = NonNull::new(unsafe { std::alloc::alloc(layout) }) {
        log_allocation(layout.size(), ptr.as_ptr());
        return ptr;
    }
    oom_fault(layout)
}

/// Resize a block, collecting cycles and retrying once if the allocator
/// refuses. A second refusal aborts. The block may move; callers must
/// repoint every stored address.
///
/// # Safety
///
/// `ptr` must denote a live block of `old_layout` whose owner count keeps
/// it out of any collected cycle, and `new_size` must be a valid size for
/// `old_layout.align()`.
pub unsafe fn grow_or_collect(
    heap: &Heap,
    ptr: NonNull<u8>,
    old_layout: Layout,
    new_size: usize,
) -> NonNull<u8> {
    debug_assert!(new_size > 0, "zero-size managed block");
    if let Some(moved) = NonNull::new(std::alloc::realloc(ptr.as_ptr(), old_layout, new_size)) {
        trace!(event = "realloc", size_bytes = new_size, address = ?moved.as_ptr(), "Resized block");
        return moved;
    }
    log_oom_retry(new_size);
    heap.collect_cycles();
    if let Some(moved) = NonNull::new(std::alloc::realloc(ptr.as_ptr(), old_layout, new_size)) {
        trace!(event = "realloc", size_bytes = new_size, address = ?moved.as_ptr(), "Resized block");
        return moved;
    }
    oom_fault(Layout::from_size_align(new_size, old_layout.align()).unwrap_or(old_layout))
}

/// Return a block to the allocator.
///
/// # Safety
///
/// `ptr` must denote a live block allocated with `layout`.
pub unsafe fn dealloc_block(ptr: NonNull<u8>, layout: Layout) {
    log_deallocation(layout.size(), ptr.as_ptr());
    std::alloc::dealloc(ptr.as_ptr(), layout);
}
