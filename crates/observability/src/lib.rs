//! Process-wide logging setup for event store binaries.

/// Initialize tracing for the process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
