//! Structured logging and diagnostics for the Rill runtime
//!
//! Design:
//! - Environment-driven configuration with sane defaults
//! - Structured events with typed fields for machine consumption
//! - Optional JSON output and non-blocking file output
//! - Performance tracking helpers for hot runtime operations
//! - Zero overhead for disabled levels

mod macros;
pub use macros::*;

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the runtime
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to emit: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Mirror events to a log file
    pub file_output: bool,
    /// Path of the log file when `file_output` is set
    pub log_path: String,
    /// Emit events as JSON objects instead of human-readable lines
    pub json_format: bool,
    /// Emit span enter/close events
    pub show_spans: bool,
    /// Emit timing events for tracked operations
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_output: false,
            log_path: "rill-runtime.log".to_string(),
            json_format: false,
            show_spans: false,
            track_performance: false,
        }
    }
}

impl LogConfig {
    /// Build a configuration from `RILL_LOG_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("RILL_LOG_LEVEL") {
            config.level = level;
        }
        if let Ok(file) = std::env::var("RILL_LOG_FILE") {
            config.file_output = true;
            if !file.is_empty() && file != "1" && file != "true" {
                config.log_path = file;
            }
        }
        if let Ok(json) = std::env::var("RILL_LOG_JSON") {
            config.json_format = json == "1" || json == "true";
        }
        if let Ok(spans) = std::env::var("RILL_LOG_SPANS") {
            config.show_spans = spans == "1" || spans == "true";
        }
        if let Ok(perf) = std::env::var("RILL_LOG_PERF") {
            config.track_performance = perf == "1" || perf == "true";
        }

        config
    }

    /// Preset for performance investigation: debug level with span timings.
    pub fn performance() -> Self {
        Self {
            level: "debug".to_string(),
            show_spans: true,
            track_performance: true,
            ..Self::default()
        }
    }

    /// Preset for deep debugging: everything on, human-readable.
    pub fn debug() -> Self {
        Self {
            level: "trace".to_string(),
            show_spans: true,
            track_performance: true,
            ..Self::default()
        }
    }
}

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initialize logging from the environment. Safe to call more than once.
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with an explicit configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("rill_runtime={}", config.level)));

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let file_layer = if config.file_output {
            let path = Path::new(&config.log_path);
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "rill-runtime.log".into());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        } else {
            None
        };

        let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

        if config.json_format {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(io::stdout)
                        .with_target(true)
                        .with_span_events(span_events),
                )
                .init();
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(true)
                        .with_thread_ids(cfg!(debug_assertions))
                        .with_line_number(cfg!(debug_assertions))
                        .with_span_events(span_events),
                )
                .init();
        }
    });
}

/// Whether a subscriber has been installed by this module.
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// Event helpers. Hot-path helpers stay at trace level so they disappear
// under the default filter.

#[inline]
pub fn log_allocation(size: usize, ptr: *const u8) {
    trace!(event = "alloc", size_bytes = size, address = ?ptr, "Allocated block");
}

#[inline]
pub fn log_deallocation(size: usize, ptr: *const u8) {
    trace!(event = "dealloc", size_bytes = size, address = ?ptr, "Freed block");
}

pub fn log_oom_retry(size: usize) {
    warn!(
        event = "oom_retry",
        size_bytes = size,
        "Allocation failed, collecting cycles before retry"
    );
}

pub fn log_gc_start(candidates: usize) {
    debug!(event = "gc_start", candidates, "Cycle collection started");
}

pub fn log_gc_mark(kept_roots: usize, freed: usize) {
    trace!(
        event = "gc_mark",
        kept_roots,
        freed,
        "Mark phase finished"
    );
}

pub fn log_gc_sweep(freed: usize) {
    trace!(event = "gc_sweep", freed, "Collect phase finished");
}

pub fn log_gc_complete(duration_us: u64, freed_acyclic: usize, freed_cyclic: usize) {
    debug!(
        event = "gc_complete",
        duration_us,
        freed_acyclic,
        freed_cyclic,
        "Cycle collection finished"
    );
}

pub fn log_runtime_init() {
    info!(event = "runtime_init", "Rill runtime initialized");
}

pub fn log_runtime_shutdown(live_objects: usize) {
    info!(
        event = "runtime_shutdown",
        live_objects,
        "Rill runtime shut down"
    );
}

/// Timing helpers for coarse operation tracking.
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Start timing an operation. The guard logs on drop.
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let duration = self.start.elapsed();
            debug!(
                event = "perf",
                operation = self.operation,
                duration_us = duration.as_micros() as u64,
                "Operation timed"
            );
        }
    }
}
