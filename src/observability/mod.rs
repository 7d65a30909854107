//! Observability for the engine: structured logging and span helpers

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{client_span, mqtt_span};
