//! Process-wide tracing setup shared by the dagops binaries.

/// Initialize tracing with JSON output and the `RUST_LOG` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Tracing configuration (filters, output format).
pub mod tracing;
