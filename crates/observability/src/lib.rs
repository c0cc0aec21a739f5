//! Tracing/logging setup shared by services embedding the event bus.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use crate::tracing::{LogFormat, init_for_tests, init_with};

/// Initialize process-wide tracing with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    init_with(LogFormat::from_env());
}
