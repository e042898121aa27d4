//! Process-wide logging setup shared by molflow binaries.

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::{init, LogFormat, ParseLogFormatError};
