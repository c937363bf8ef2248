//! Pure connection state and configuration for the MQTT session
//!
//! This module holds the session status machine, the caller-facing connect config,
//! the owned copy of it kept for reconnects, and the tunables of the sync loop.

use super::health_monitor::{BackoffConfig, ClassifierPolicy};
use super::protocol::{BufferSizes, ConnectOptions};
use crate::error::{SessionError, SessionResult};
use rumqttc::mqttbytes::QoS;
use std::fmt;
use std::time::Duration;

/// Port used when the caller leaves it unset
pub const DEFAULT_PORT: &str = "1883";

/// Keep-alive applied when the caller passes zero
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 400;

/// Connection status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No `connect()` yet, or torn down by `disconnect()`
    #[default]
    Uninitialized,
    /// Socket open, handshake in flight
    Connecting,
    /// Handshake complete and sync loop running
    Connected,
    /// Connection lost, the sync loop will try to recover it
    Disconnected,
    /// Reconnection gave up; only a fresh `connect()` recovers
    ReconnectFailed,
}

impl SessionStatus {
    /// Whether a session exists at all
    pub fn is_initialized(self) -> bool {
        self != SessionStatus::Uninitialized
    }

    /// Whether a socket belongs to the session in this status
    pub fn holds_socket(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Connected)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::ReconnectFailed => "reconnect failed",
        };
        f.write_str(name)
    }
}

/// Connect parameters supplied by the caller
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MqttConfig {
    /// Broker host name or address. Required.
    pub host: String,
    /// Broker port, defaults to 1883
    pub port: Option<String>,
    /// Client identifier, anonymous when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive in seconds, zero selects the default of 400
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

impl MqttConfig {
    /// Config for `host` with every other field at its default
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            clean_session: true,
            ..Default::default()
        }
    }

    pub fn with_port<S: Into<String>>(mut self, port: S) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Reject configs that cannot be connected with
    pub fn validate(&self) -> SessionResult<()> {
        if self.host.trim().is_empty() {
            return Err(SessionError::invalid_config("host is required"));
        }
        if let Some(port) = &self.port {
            if port.is_empty() {
                return Err(SessionError::invalid_config("port cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Owned copy of the connect config, defaults applied.
///
/// Built once per explicit `connect()` and reused unchanged by every reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConfig {
    pub host: String,
    pub port: String,
    pub options: ConnectOptions,
}

impl SavedConfig {
    pub fn from_config(config: &MqttConfig) -> Self {
        let keep_alive_secs = if config.keep_alive_secs == 0 {
            DEFAULT_KEEP_ALIVE_SECS
        } else {
            config.keep_alive_secs
        };

        Self {
            host: config.host.clone(),
            port: config
                .port
                .clone()
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            options: ConnectOptions {
                client_id: config.client_id.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                keep_alive_secs,
                clean_session: config.clean_session,
            },
        }
    }

    /// `host:port` for logging
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tunables of a session and its sync loop
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Reconnect attempts allowed after a connection loss
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Bound on socket open and on waiting for CONNACK
    pub connect_timeout: Duration,
    /// Sleep between sync cycles
    pub sync_interval: Duration,
    pub classifier: ClassifierPolicy,
    pub buffers: BufferSizes,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_millis(100),
            classifier: ClassifierPolicy::default(),
            buffers: BufferSizes::default(),
        }
    }
}

/// Map a numeric QoS level to the library's publish mode. Anything outside 0-2 is 0.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_config_applies_defaults() {
        let saved = SavedConfig::from_config(&MqttConfig::new("broker.example"));

        assert_eq!(saved.host, "broker.example");
        assert_eq!(saved.port, "1883");
        assert_eq!(saved.options.keep_alive_secs, 400);
        assert_eq!(saved.options.client_id, None);
        assert!(saved.options.clean_session);
        assert_eq!(saved.endpoint(), "broker.example:1883");
    }

    #[test]
    fn test_saved_config_keeps_explicit_values() {
        let config = MqttConfig::new("10.0.0.5")
            .with_port("8884")
            .with_client_id("device-7")
            .with_credentials("user", "secret")
            .with_keep_alive(30)
            .with_clean_session(false);
        let saved = SavedConfig::from_config(&config);

        assert_eq!(saved.port, "8884");
        assert_eq!(saved.options.client_id.as_deref(), Some("device-7"));
        assert_eq!(saved.options.username.as_deref(), Some("user"));
        assert_eq!(saved.options.password.as_deref(), Some("secret"));
        assert_eq!(saved.options.keep_alive_secs, 30);
        assert!(!saved.options.clean_session);
    }

    #[test]
    fn test_saved_config_does_not_truncate() {
        let long_id = "d".repeat(1000);
        let saved = SavedConfig::from_config(&MqttConfig::new("h").with_client_id(long_id.clone()));
        assert_eq!(saved.options.client_id, Some(long_id));
    }

    #[test]
    fn test_validate_requires_host() {
        assert!(matches!(
            MqttConfig::new("").validate(),
            Err(SessionError::InvalidConfig(_))
        ));
        assert!(MqttConfig::new("   ").validate().is_err());
        assert!(MqttConfig::new("broker").with_port("").validate().is_err());
        assert!(MqttConfig::new("broker").validate().is_ok());
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = MqttConfig::new("h").with_credentials("u", "topsecret");
        assert!(!format!("{config:?}").contains("topsecret"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(5), QoS::AtMostOnce);
        assert_eq!(qos_from_level(u8::MAX), QoS::AtMostOnce);
    }

    #[test]
    fn test_status_socket_ownership() {
        assert!(SessionStatus::Connecting.holds_socket());
        assert!(SessionStatus::Connected.holds_socket());
        assert!(!SessionStatus::Disconnected.holds_socket());
        assert!(!SessionStatus::ReconnectFailed.holds_socket());
        assert!(!SessionStatus::Uninitialized.is_initialized());
        assert_eq!(SessionStatus::ReconnectFailed.to_string(), "reconnect failed");
    }

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.sync_interval, Duration::from_millis(100));
        assert_eq!(settings.backoff.base_delay_ms, 1000);
        assert_eq!(settings.backoff.max_delay_ms, 30000);
        assert!(settings.classifier.retry_unknown);
    }
}
