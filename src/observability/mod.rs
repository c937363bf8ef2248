//! Observability for the MQTT session
//!
//! Structured logging only; the session reports its health through
//! [`crate::transport::mqtt::SessionSnapshot`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};
