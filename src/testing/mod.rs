//! Testing utilities and mock implementations
//!
//! Mocks for exercising the MQTT session without a network or a broker.

pub mod mocks;

pub use mocks::*;
