//! Observability for the client
//!
//! Structured logging setup and span macros.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, dispatch_span};
