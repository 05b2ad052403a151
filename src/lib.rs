//! Rill Runtime - Memory management core for compiled Rill programs
//!
//! This crate provides the managed heap support statically linked into
//! compiled Rill programs.

// Memory core modules
pub mod alloc;
pub mod buffer;
mod fault;
pub mod gc;
pub mod logging;

// Re-export commonly used items
pub use buffer::CowBuffer;
pub use gc::{
    collect_cycles, CollectStats, Color, Handle, Heap, HeapStats, RefCount, Trace, TracerFn,
    MAX_ROOTS,
};

/// Initialize the runtime for the embedding host: install the logging
/// subscriber and touch the calling thread's heap.
#[no_mangle]
pub extern "C" fn rill_runtime_init() {
    logging::init();
    let _heap = Heap::current();
    logging::log_runtime_init();
}

/// Shut the runtime down: run a final collection pass on the calling
/// thread's heap so deferred corpses and dead cycles are returned.
#[no_mangle]
pub extern "C" fn rill_runtime_shutdown() {
    let heap = Heap::current();
    heap.collect_cycles();
    logging::log_runtime_shutdown(heap.stats().live_objects);
}
