//! Tracing and logging setup shared by the worker binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// The output format comes from `RELISTER_LOG_FORMAT` (`json` or `pretty`).
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(logging::LogFormat::from_env());
}

/// Tracing subscriber installation (filters, formatters).
pub mod tracing;

/// Log output format selection.
pub mod logging;
