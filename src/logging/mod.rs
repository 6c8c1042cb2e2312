//! Structured logging and audit lines.

mod format;

pub use format::{StoreEvent, StructuredLogger};
