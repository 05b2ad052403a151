//! Tracing protocol: how managed payloads expose their child references
//!
//! The collector never sees concrete payload types. Payloads implement
//! [`Trace`] to enumerate the handles and buffers they own; the cell types
//! wrap that into the erased [`Collectible`] protocol the phases and the
//! root buffer operate on.

use crate::gc::header::ObjectHeader;
use crate::logging::warn;
use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr::NonNull;

/// Callback fed to [`Trace::trace`], invoked once per child cell.
pub type TracerFn<'a> = dyn FnMut(&dyn Collectible) + 'a;

/// Types that can live inside a managed cell.
///
/// Leaf types implement this as a no-op. Aggregates forward to each field
/// that can own a handle or a buffer.
///
/// # Safety
///
/// `trace` must invoke `tracer_fn` exactly once for every owned child cell
/// and must not retain, release, or allocate while doing so. A hidden or
/// double-visited edge corrupts the counts the collector bases frees on.
pub unsafe trait Trace: 'static {
    fn trace(&self, tracer_fn: &mut TracerFn);
}

/// Erased cell protocol the collector works through.
///
/// # Safety
///
/// Implementations must report a header, child set, and layout that all
/// describe the same allocation, and `drop_payload` must leave the header
/// itself intact.
pub unsafe trait Collectible {
    /// The cell's bookkeeping header.
    fn header(&self) -> &ObjectHeader;

    /// Visit every child edge held by the payload.
    ///
    /// Must not be called after `drop_payload`.
    fn trace_children(&self, tracer: &mut TracerFn);

    /// Run the payload's destructor in place.
    ///
    /// # Safety
    ///
    /// One call per cell, and nothing may read the payload afterwards.
    unsafe fn drop_payload(&self);

    /// Layout of the whole allocation, for the final free.
    fn block_layout(&self) -> Layout {
        Layout::for_value(self)
    }
}

/// Erased pointer the root buffer stores.
pub(crate) type CellPtr = NonNull<dyn Collectible>;

macro_rules! leaf_impls {
    ($($ty:ty),* $(,)?) => {
        $(
            unsafe impl Trace for $ty {
                #[inline]
                fn trace(&self, _tracer_fn: &mut TracerFn) {}
            }
        )*
    };
}

leaf_impls!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        if let Some(value) = self {
            value.trace(tracer_fn);
        }
    }
}

unsafe impl<T: Trace> Trace for Box<T> {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        (**self).trace(tracer_fn);
    }
}

unsafe impl<T: Trace> Trace for [T] {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        for element in self {
            element.trace(tracer_fn);
        }
    }
}

unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        self.as_slice().trace(tracer_fn);
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        self.as_slice().trace(tracer_fn);
    }
}

unsafe impl<A: Trace, B: Trace> Trace for (A, B) {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        self.0.trace(tracer_fn);
        self.1.trace(tracer_fn);
    }
}

unsafe impl<A: Trace, B: Trace, C: Trace> Trace for (A, B, C) {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        self.0.trace(tracer_fn);
        self.1.trace(tracer_fn);
        self.2.trace(tracer_fn);
    }
}

unsafe impl<T: Trace> Trace for RefCell<T> {
    fn trace(&self, tracer_fn: &mut TracerFn) {
        match self.try_borrow() {
            Ok(value) => value.trace(tracer_fn),
            Err(_) => {
                // A mutably borrowed payload cannot be traced. Skipping its
                // edges keeps the cell conservatively alive.
                warn!(event = "trace_skipped", "Payload mutably borrowed during trace");
            }
        }
    }
}
