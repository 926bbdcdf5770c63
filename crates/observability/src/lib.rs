//! Shared tracing setup for services and tests embedding the message store.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, init_test, init_with};

/// Initialize process-wide JSON logging filtered by `RUST_LOG` (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init_with("info", LogFormat::Json);
}
