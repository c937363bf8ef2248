//! Persistent MQTT session with autonomous reconnection
//!
//! This module separates pure decision logic from I/O so the reconnection behavior
//! can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure session status, connect config and tunables
//! - [`health_monitor`] - Pure error classification, backoff and reconnect decisions
//! - [`protocol`] - Boundary traits of the MQTT protocol library
//! - [`packet_client`] - Protocol library implementation on `rumqttc`'s codec
//! - [`message_handler`] - Receive callbacks
//! - [`client`] - The session handle and its shared state
//! - `sync_loop` - The background task that keeps the connection alive
//!
//! # Usage
//!
//! ```rust,no_run
//! use dx_mqtt::transport::mqtt::{channel_handler, MqttConfig, MqttSession, SessionSettings};
//!
//! # tokio_test::block_on(async {
//! let (handler, mut messages) = channel_handler(64);
//! let mut session = MqttSession::new(SessionSettings::default());
//!
//! session
//!     .connect(&MqttConfig::new("broker.example").with_client_id("device-7"), Some(handler))
//!     .await?;
//! session.subscribe("sensors/#", 1).await?;
//! session.publish("sensors/temp", b"21.5", 0, false).await?;
//!
//! if let Some(message) = messages.recv().await {
//!     println!("{}: {}", message.topic, message.payload_str());
//! }
//!
//! session.disconnect().await;
//! # Ok::<(), dx_mqtt::error::SessionError>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod packet_client;
pub mod protocol;
mod sync_loop;

pub use client::{MqttSession, SessionSnapshot};
pub use connection::{
    qos_from_level, MqttConfig, SavedConfig, SessionSettings, SessionStatus, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_PORT,
};
pub use health_monitor::{
    BackoffConfig, ClassifierPolicy, ErrorClass, ErrorClassifier, HealthMonitor,
    ReconnectionDecision,
};
pub use message_handler::{channel_handler, handler_fn, MessageHandler, ReceivedMessage};
pub use packet_client::{PacketClient, PacketClientFactory};
pub use protocol::{
    BufferSizes, ConnectOptions, ProtocolClient, ProtocolErrorCode, ProtocolFactory,
    ProtocolResult,
};
