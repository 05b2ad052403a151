//! Copy-on-write growable buffers
//!
//! Design:
//! 1. Storage is a managed cell: bookkeeping header, shared length, then
//!    the elements in the same allocation
//! 2. A handle is two words, block pointer plus the capacity this handle
//!    believes usable; clones share the block and bump its count
//! 3. Mutation forks: a shared block is cloned element-by-element before
//!    the first write, and the old reference is released
//! 4. Blocks take part in cycle collection like any other cell. `clear`
//!    only releases the reference; element destructors run when the block
//!    itself dies


use crate::alloc::{self, block};
use crate::fault::fault;
use crate::gc::{
    release, retain, CellPtr, Collectible, Heap, ObjectHeader, RefCount, Trace, TracerFn,
};
use crate::logging::{perf, trace};
use static_assertions::{assert_not_impl_any, const_assert};
use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};
use std::slice;

// Amortized growth factor.
const GROWTH_NUMERATOR: usize = 7;
const GROWTH_DENOMINATOR: usize = 4;
const_assert!(GROWTH_NUMERATOR > GROWTH_DENOMINATOR);

/// A buffer block: header and length shared by every handle, elements
/// placed after the struct at [`data_offset`].
///
/// The header must stay the leading field; the collector recovers it from
/// the bare block address.
#[repr(C)]
struct BufferCell<T: Trace> {
    header: ObjectHeader,
    length: Cell<usize>,
    capacity: Cell<usize>,
    _elements: PhantomData<T>,
}

impl<T: Trace> BufferCell<T> {
    #[inline]
    fn data_ptr(&self) -> *mut T {
        let base = self as *const BufferCell<T> as *const u8;
        unsafe { base.add(data_offset::<T>()) as *mut T }
    }
}

unsafe impl<T: Trace> Collectible for BufferCell<T> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn trace_children(&self, tracer: &mut TracerFn) {
        let data = self.data_ptr();
        for index in 0..self.length.get() {
            unsafe { &*data.add(index) }.trace(tracer);
        }
    }

    unsafe fn drop_payload(&self) {
        if mem::needs_drop::<T>() {
            let data = self.data_ptr();
            for index in 0..self.length.get() {
                ptr::drop_in_place(data.add(index));
            }
        }
    }

    fn block_layout(&self) -> Layout {
        buffer_layout::<T>(self.capacity.get()).0
    }
}

/// Offset of the element array from the block base. Constant per type.
fn data_offset<T: Trace>() -> usize {
    let (_, offset) = block::extend(Layout::new::<BufferCell<T>>(), block::array::<T>(0));
    offset
}

/// Layout of a block with `capacity` element slots, and the element offset.
fn buffer_layout<T: Trace>(capacity: usize) -> (Layout, usize) {
    let (layout, offset) = block::extend(Layout::new::<BufferCell<T>>(), block::array::<T>(capacity));
    (layout.pad_to_align(), offset)
}

fn cell_ptr<T: Trace>(block: NonNull<BufferCell<T>>) -> CellPtr {
    unsafe { NonNull::new_unchecked(block.as_ptr() as *mut dyn Collectible) }
}

fn allocate_block<T: Trace>(heap: &Heap, capacity: usize) -> NonNull<BufferCell<T>> {
    debug_assert!(capacity > 0, "empty buffer blocks are never allocated");
    let (layout, _) = buffer_layout::<T>(capacity);
    let raw = alloc::alloc_or_collect(heap, layout);
    let block = raw.cast::<BufferCell<T>>();
    unsafe {
        block.as_ptr().write(BufferCell {
            header: ObjectHeader::new(heap.clone()),
            length: Cell::new(0),
            capacity: Cell::new(capacity),
            _elements: PhantomData,
        });
    }
    heap.note_allocated();
    trace!(
        event = "buffer_new",
        capacity,
        address = ?raw.as_ptr(),
        "Allocated buffer block"
    );
    block
}

/// Copy-on-write handle to a growable element block.
///
/// Clones share the block; the first mutation through a sharing handle
/// clones the elements into a fresh block first. An empty buffer owns no
/// block at all.
pub struct CowBuffer<T: Trace> {
    block: Option<NonNull<BufferCell<T>>>,
    capacity: usize,
}

assert_not_impl_any!(CowBuffer<u32>: Send, Sync);

impl<T: Trace> CowBuffer<T> {
    /// Empty buffer with no storage.
    pub const fn new() -> Self {
        Self {
            block: None,
            capacity: 0,
        }
    }

    /// Buffer backed by a fresh block of `capacity` slots in `heap`.
    pub fn with_capacity(heap: &Heap, capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.realloc_in(heap, capacity);
        buffer
    }

    #[inline]
    fn cell(&self) -> Option<&BufferCell<T>> {
        self.block.map(|block| unsafe { block.as_ref() })
    }

    fn heap(&self) -> Heap {
        match self.cell() {
            Some(cell) => cell.header().heap().clone(),
            None => Heap::current(),
        }
    }

    /// Number of live elements in the shared block.
    pub fn len(&self) -> usize {
        self.cell().map_or(0, |cell| cell.length.get())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots this handle believes usable.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this handle is the only owner of its block.
    pub fn is_unique(&self) -> bool {
        match self.cell() {
            None => true,
            Some(cell) => match cell.header().refcount() {
                RefCount::Owned(count) => count < 2,
                RefCount::Immortal => false,
            },
        }
    }

    /// Resize this handle's block, allocating in the calling thread's heap
    /// if the buffer owns no block yet.
    pub fn realloc(&mut self, capacity: usize) {
        self.realloc_in(&self.heap(), capacity);
    }

    /// Resize this handle's block. `heap` is used when a fresh block must
    /// be allocated; an existing block stays on the heap it was born in.
    ///
    /// Faults if `capacity` drops below the live length. Resizing a shared
    /// block is a caller bug, checked in debug builds.
    pub fn realloc_in(&mut self, heap: &Heap, capacity: usize) {
        let length = self.len();
        if capacity < length {
            fault("buffer capacity below live length");
        }
        let Some(old_block) = self.block else {
            if capacity == 0 {
                return;
            }
            self.block = Some(allocate_block::<T>(heap, capacity));
            self.capacity = capacity;
            return;
        };
        if capacity == 0 {
            self.clear();
            return;
        }
        debug_assert!(self.is_unique(), "resize of a shared buffer block");
        let (old_capacity, block_heap) = {
            let cell = unsafe { old_block.as_ref() };
            debug_assert_eq!(self.capacity, cell.capacity.get());
            (cell.capacity.get(), cell.header().heap().clone())
        };
        if capacity == old_capacity {
            return;
        }
        let (old_layout, _) = buffer_layout::<T>(old_capacity);
        let (new_layout, _) = buffer_layout::<T>(capacity);
        let old_thin = old_block.cast::<u8>();
        let moved =
            unsafe { alloc::grow_or_collect(&block_heap, old_thin, old_layout, new_layout.size()) };
        let new_block = moved.cast::<BufferCell<T>>();
        unsafe { new_block.as_ref() }.capacity.set(capacity);
        // A moved block leaves a stale slot behind if it was parked in the
        // root buffer.
        if moved != old_thin && unsafe { new_block.as_ref() }.header().buffered() {
            block_heap.rewrite_root(old_thin.as_ptr() as *const u8, cell_ptr(new_block));
        }
        self.block = Some(new_block);
        self.capacity = capacity;
    }

    /// Grow to at least `min_capacity` using the amortized growth factor.
    pub fn ensure_capacity_at_least(&mut self, min_capacity: usize) {
        if self.capacity < min_capacity {
            let grown = self.capacity.saturating_mul(GROWTH_NUMERATOR) / GROWTH_DENOMINATOR;
            self.realloc(min_capacity.max(grown));
        }
    }

    /// Make this handle the sole owner of its block, with room for at
    /// least `min_capacity` elements. A shared block is forked: elements
    /// are cloned into a fresh block and the old reference released.
    pub fn ensure_unique_capacity(&mut self, min_capacity: usize)
    where
        T: Clone,
    {
        let Some(source_block) = self.block else {
            self.realloc(min_capacity);
            return;
        };
        if self.is_unique() {
            self.ensure_capacity_at_least(min_capacity);
            return;
        }
        let _fork_timing = perf::track("buffer_fork");
        let length = self.len();
        let target = min_capacity.max(length);
        let heap = unsafe { source_block.as_ref() }.header().heap().clone();
        let mut fresh: CowBuffer<T> = CowBuffer::new();
        fresh.realloc_in(&heap, target);
        if let Some(fresh_block) = fresh.block {
            let source = unsafe { source_block.as_ref() };
            let destination = unsafe { fresh_block.as_ref() };
            for index in 0..length {
                let value = unsafe { &*source.data_ptr().add(index) }.clone();
                unsafe { destination.data_ptr().add(index).write(value) };
                destination.length.set(index + 1);
            }
        }
        trace!(event = "buffer_fork", length, target, "Forked shared buffer block");
        *self = fresh;
    }

    /// Make this handle the sole owner of its block.
    pub fn ensure_unique(&mut self)
    where
        T: Clone,
    {
        self.ensure_unique_capacity(self.len());
    }

    /// Append `value`, forking or growing first as needed.
    pub fn push(&mut self, value: T)
    where
        T: Clone,
    {
        let length = self.len();
        self.ensure_unique_capacity(length + 1);
        let Some(cell) = self.cell() else {
            debug_assert!(false, "push left the buffer without a block");
            return;
        };
        unsafe { cell.data_ptr().add(length).write(value) };
        cell.length.set(length + 1);
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T>
    where
        T: Clone,
    {
        let length = self.len();
        if length == 0 {
            return None;
        }
        self.ensure_unique();
        let cell = self.cell()?;
        cell.length.set(length - 1);
        Some(unsafe { cell.data_ptr().add(length - 1).read() })
    }

    /// Drop this handle's reference to its block. Elements are destroyed
    /// when the block itself dies.
    pub fn clear(&mut self) {
        if let Some(block) = self.block.take() {
            unsafe { release(cell_ptr(block)) };
        }
        self.capacity = 0;
    }

    /// Borrow the elements. Reading through a shared block is fine.
    pub fn as_slice(&self) -> &[T] {
        match self.cell() {
            Some(cell) => unsafe {
                slice::from_raw_parts(cell.data_ptr() as *const T, cell.length.get())
            },
            None => &[],
        }
    }

    /// Borrow the elements mutably. Writing through a shared block is a
    /// caller bug, checked in debug builds.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        debug_assert!(self.is_unique(), "mutable access to a shared buffer block");
        match self.cell() {
            Some(cell) => unsafe {
                slice::from_raw_parts_mut(cell.data_ptr(), cell.length.get())
            },
            None => &mut [],
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Set the live length directly.
    ///
    /// # Safety
    ///
    /// Elements `0..length` must be initialized, `length` must not exceed
    /// the handle's capacity, and the block must be uniquely owned.
    pub unsafe fn set_len(&mut self, length: usize) {
        debug_assert!(length <= self.capacity, "length beyond capacity");
        debug_assert!(self.is_unique(), "length change on a shared block");
        match self.cell() {
            Some(cell) => cell.length.set(length),
            None => debug_assert!(length == 0, "length set on an empty buffer"),
        }
    }
}

impl<T: Trace> Clone for CowBuffer<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            retain(unsafe { block.as_ref() });
        }
        Self {
            block: self.block,
            capacity: self.capacity,
        }
    }
}

impl<T: Trace> Drop for CowBuffer<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: Trace> Default for CowBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Trace> Index<usize> for CowBuffer<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &T {
        debug_assert!(index < self.len(), "buffer index out of bounds");
        unsafe { self.as_slice().get_unchecked(index) }
    }
}

impl<T: Trace> IndexMut<usize> for CowBuffer<T> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(index < self.len(), "buffer index out of bounds");
        unsafe { self.as_mut_slice().get_unchecked_mut(index) }
    }
}

impl<'a, T: Trace> IntoIterator for &'a CowBuffer<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Trace + fmt::Debug> fmt::Debug for CowBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

unsafe impl<T: Trace> Trace for CowBuffer<T> {
    fn trace(&self, tracer_fn: &mut TracerFn) {
        if let Some(block) = self.block {
            tracer_fn(unsafe { block.as_ref() });
        }
    }
}
