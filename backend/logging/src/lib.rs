//! Structured logging for the modforge runtime.
//!
//! Console plus rolling NDJSON file output, and the per-extension event log.

pub mod event_logger;
pub mod logger;

pub use event_logger::{ExtensionEvent, ExtensionEventEntry, ExtensionEventLogger};
pub use logger::{init_console_logger, init_logger};
