//! Macro re-exports
//!
//! Runtime modules import the tracing macros through `crate::logging` so the
//! logging backend stays swappable in one place.

pub use tracing::{debug, error, info, trace, warn};
