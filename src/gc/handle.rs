//! Owning handles to managed cells
//!
//! A cell is one allocation: [`ObjectHeader`] followed by the payload.
//! [`Handle`] is the owning reference the mutator holds; cloning retains,
//! dropping releases. The final release destroys the payload in place and
//! frees the block unless the cell is parked in the root buffer, in which
//! case the memory release is deferred to the next collection.

use crate::alloc;
use crate::fault::fault;
use crate::gc::header::{Color, ObjectHeader, RefCount};
use crate::gc::trace::{CellPtr, Collectible, Trace, TracerFn};
use crate::gc::Heap;
use crate::logging::trace;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use static_assertions::assert_not_impl_any;
use std::alloc::Layout;

/// A managed object cell: bookkeeping header followed by the payload.
///
/// The header must stay the leading field; the collector recovers it from
/// the bare block address.
#[repr(C)]
pub(crate) struct ObjectCell<T: Trace> {
    header: ObjectHeader,
    payload: UnsafeCell<ManuallyDrop<T>>,
}

impl<T: Trace> ObjectCell<T> {
    #[inline]
    fn payload(&self) -> &T {
        // ManuallyDrop<T> is transparent over T.
        unsafe { &*(self.payload.get() as *const T) }
    }

    #[inline]
    fn payload_ptr(&self) -> *mut T {
        self.payload.get() as *mut T
    }
}

unsafe impl<T: Trace> Collectible for ObjectCell<T> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn trace_children(&self, tracer: &mut TracerFn) {
        self.payload().trace(tracer);
    }

    unsafe fn drop_payload(&self) {
        ptr::drop_in_place(self.payload_ptr());
    }
}

/// Offset of the payload inside the cell, for raw-pointer round trips.
fn payload_offset<T: Trace>() -> usize {
    let (_, offset) = alloc::block::extend(Layout::new::<ObjectHeader>(), Layout::new::<T>());
    offset
}

/// Owning reference to a managed object.
///
/// The payload is shared between handles; mutate it through interior
/// mutability, or through [`Handle::get_mut`] while the count is one.
pub struct Handle<T: Trace> {
    ptr: NonNull<ObjectCell<T>>,
    _marker: PhantomData<ObjectCell<T>>,
}

assert_not_impl_any!(Handle<()>: Send, Sync);

impl Heap {
    /// Allocate a managed object with an initial count of one.
    pub fn alloc<T: Trace>(&self, value: T) -> Handle<T> {
        Handle::allocate(self, value, false)
    }

    /// Allocate an immortal object. It is never destroyed and the collector
    /// never traces through it.
    pub fn alloc_immortal<T: Trace>(&self, value: T) -> Handle<T> {
        Handle::allocate(self, value, true)
    }
}

impl<T: Trace> Handle<T> {
    fn allocate(heap: &Heap, value: T, immortal: bool) -> Self {
        let layout = Layout::new::<ObjectCell<T>>();
        let raw = alloc::alloc_or_collect(heap, layout);
        let cell = raw.cast::<ObjectCell<T>>();
        let header = if immortal {
            ObjectHeader::new_immortal(heap.clone())
        } else {
            ObjectHeader::new(heap.clone())
        };
        unsafe {
            cell.as_ptr().write(ObjectCell {
                header,
                payload: UnsafeCell::new(ManuallyDrop::new(value)),
            });
        }
        heap.note_allocated();
        trace!(
            event = "object_new",
            address = ?cell.as_ptr(),
            immortal,
            "Allocated object"
        );
        Self {
            ptr: cell,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn cell(&self) -> &ObjectCell<T> {
        unsafe { self.ptr.as_ref() }
    }

    #[inline]
    fn cell_ptr(&self) -> CellPtr {
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut dyn Collectible) }
    }

    /// Current reference count.
    pub fn ref_count(&self) -> RefCount {
        self.cell().header().refcount()
    }

    pub fn is_immortal(&self) -> bool {
        self.cell().header().is_immortal()
    }

    /// Whether two handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::eq(self.ptr.as_ptr(), other.ptr.as_ptr())
    }

    /// Exclusive payload access while this is the only handle.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.cell().header().refcount() {
            RefCount::Owned(1) => Some(unsafe { &mut *self.cell().payload_ptr() }),
            _ => None,
        }
    }

    /// Payload pointer for foreign-function hand-off. Does not retain.
    pub fn as_ptr(&self) -> *const T {
        self.cell().payload_ptr() as *const T
    }

    /// Leak this handle's reference, returning the payload pointer.
    pub fn into_raw(self) -> *const T {
        let ptr = self.as_ptr();
        core::mem::forget(self);
        ptr
    }

    /// Rebuild a handle from a pointer produced by [`Handle::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` on a cell of the same payload type,
    /// and the reference leaked there must still be outstanding.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        debug_assert!(!ptr.is_null(), "null payload pointer");
        let cell = (ptr as *const u8).sub(payload_offset::<T>()) as *mut ObjectCell<T>;
        Self {
            ptr: NonNull::new_unchecked(cell),
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn color(&self) -> Color {
        self.cell().header().color()
    }

    #[cfg(test)]
    pub(crate) fn is_buffered(&self) -> bool {
        self.cell().header().buffered()
    }
}

impl<T: Trace> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        retain(self.cell());
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: Trace> Drop for Handle<T> {
    #[inline]
    fn drop(&mut self) {
        unsafe { release(self.cell_ptr()) };
    }
}

impl<T: Trace> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.cell().payload()
    }
}

impl<T: Trace + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

unsafe impl<T: Trace> Trace for Handle<T> {
    #[inline]
    fn trace(&self, tracer_fn: &mut TracerFn) {
        tracer_fn(self.cell());
    }
}

/// Add one owner to a live cell. Retaining a destroyed cell faults.
pub(crate) fn retain(cell: &dyn Collectible) {
    let header = cell.header();
    if header.destroyed() {
        fault("retain of a destroyed object");
    }
    match header.refcount() {
        RefCount::Immortal => return,
        RefCount::Owned(n) => {
            if n == usize::MAX {
                fault("reference count overflow");
            }
            header.set_refcount(RefCount::Owned(n + 1));
        }
    }
    header.set_color(Color::Black);
}

/// Drop one owner: destroy on zero, buffer as a cycle candidate otherwise.
/// Releasing a cell whose payload is already destroyed is a no-op.
pub(crate) unsafe fn release(cell: CellPtr) {
    let header = cell.as_ref().header();
    let count = match header.refcount() {
        RefCount::Immortal => return,
        RefCount::Owned(n) => n,
    };
    if header.destroyed() {
        return;
    }
    debug_assert!(count > 0, "release of a dead cell");
    let count = count - 1;
    header.set_refcount(RefCount::Owned(count));
    if count == 0 {
        destroy(cell);
    } else if header.color() != Color::Purple {
        header.set_color(Color::Purple);
        let heap = header.heap().clone();
        heap.possible_root(cell);
    }
}

/// Final-release path: destroy the payload, then free the block unless the
/// cell sits in the root buffer.
#[cold]
unsafe fn destroy(cell: CellPtr) {
    let header = cell.as_ref().header();
    header.set_color(Color::Black);
    let was_buffered = header.buffered();
    header.set_destroyed();
    // The heap handle must outlive the payload destructor: a release
    // cascade can run a pass that frees this very cell while buffered.
    let heap = header.heap().clone();
    trace!(
        event = "object_destroy",
        address = ?cell.cast::<u8>().as_ptr(),
        deferred = was_buffered,
        "Destroying object"
    );
    if was_buffered {
        // The mark step treats this cell as a freeable corpse from here
        // on. Hold passes off until the destructor below returns, or a
        // release cascade filling the root buffer would free the block
        // under it.
        let was_collecting = heap.inner.collecting.replace(true);
        cell.as_ref().drop_payload();
        heap.inner.collecting.set(was_collecting);
        heap.note_destroyed();
    } else {
        cell.as_ref().drop_payload();
        heap.note_destroyed();
        free_block(cell);
    }
}

/// Free the memory of a cell whose payload is already destroyed.
pub(crate) unsafe fn free_block(cell: CellPtr) {
    let layout = cell.as_ref().block_layout();
    // The header is the leading field of every cell type; dropping it
    // releases the heap backlink.
    ptr::drop_in_place(cell.cast::<ObjectHeader>().as_ptr());
    alloc::dealloc_block(cell.cast::<u8>(), layout);
}
