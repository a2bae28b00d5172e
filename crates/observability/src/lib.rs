//! Process-wide logging setup.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use crate::tracing::{LogOptions, level_for_verbosity};

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(options: LogOptions) {
    crate::tracing::init(&options);
}
