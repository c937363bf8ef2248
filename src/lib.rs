//! dx-mqtt - persistent MQTT sessions for IoT devices
//!
//! A caller connects once; the session keeps itself alive. A background sync loop
//! services the protocol client, notices when the link drops and reconnects with
//! exponential backoff until it succeeds, hits a non-retriable error or runs out of
//! attempts.
//!
//! # Overview
//!
//! - [`transport::mqtt::MqttSession`]: connect, publish, subscribe, disconnect
//! - [`transport::mqtt::HealthMonitor`]: error classification and backoff policy
//! - [`transport::socket`]: TCP socket lifecycle
//! - [`config`]: TOML configuration with credentials from the environment
//! - [`observability`]: structured logging
//!
//! # Quick Start
//!
//! ```no_run
//! use dx_mqtt::{MqttConfig, MqttSession, SessionSettings};
//!
//! # async fn run() -> Result<(), dx_mqtt::SessionError> {
//! let mut session = MqttSession::new(SessionSettings::default());
//! let config = MqttConfig::new("broker.local").with_client_id("sensor-12");
//!
//! session.connect(&config, None).await?;
//! session.publish("sensors/12/temp", b"21.5", 1, false).await?;
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{AppConfig, ConfigError};
pub use error::{SessionError, SessionResult};
pub use transport::mqtt::{
    channel_handler, handler_fn, MqttConfig, MqttSession, SessionSettings, SessionSnapshot,
    SessionStatus,
};
