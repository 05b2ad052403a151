//! Fatal-fault reporting
//!
//! Invariant violations and unrecoverable resource exhaustion terminate the
//! process. The diagnostic goes to stderr unconditionally and to the tracing
//! subscriber when one is installed.

use crate::logging::error;
use std::alloc::Layout;

/// Report a fatal usage error and abort.
#[cold]
pub(crate) fn fault(msg: &str) -> ! {
    error!(event = "fatal_fault", message = msg, "Fatal runtime fault");
    eprintln!("rill runtime: fatal fault: {msg}");
    std::process::abort();
}

/// Report an unrecoverable allocation failure and abort.
///
/// Reached only after the retry-after-collection path has already run.
#[cold]
pub(crate) fn oom_fault(layout: Layout) -> ! {
    error!(
        event = "out_of_memory",
        size_bytes = layout.size(),
        align = layout.align(),
        "Allocation failed after collection retry"
    );
    eprintln!("rill runtime: out of memory ({} bytes)", layout.size());
    std::process::abort();
}
