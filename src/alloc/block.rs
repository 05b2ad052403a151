//! Checked layout math for managed blocks

use crate::fault::fault;
use std::alloc::Layout;

/// Extend `base` with `next` the way `#[repr(C)]` lays out consecutive
/// fields, faulting on address-space overflow.
///
/// Returns the combined layout and the offset of `next` inside it. The
/// result is not padded; callers pad once the block is complete.
pub(crate) fn extend(base: Layout, next: Layout) -> (Layout, usize) {
    match base.extend(next) {
        Ok(pair) => pair,
        Err(_) => fault("allocation layout overflow"),
    }
}

/// Layout of a `[T; capacity]` tail, faulting on overflow.
pub(crate) fn array<T>(capacity: usize) -> Layout {
    match Layout::array::<T>(capacity) {
        Ok(layout) => layout,
        Err(_) => fault("buffer capacity overflow"),
    }
}
