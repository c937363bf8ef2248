//! Configuration for the dx-mqtt session
//!
//! A TOML file describes the broker, the session tunables and the topics to subscribe.
//! Credentials are never stored in the file; it names the environment variables that
//! hold them and they are read at runtime.

use crate::transport::mqtt::{
    BackoffConfig, BufferSizes, ClassifierPolicy, HealthMonitor, MqttConfig, SessionSettings,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub session: SessionSection,
    /// Topics subscribed after every explicit connect
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Broker connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port`. Ignored when `host` is set.
    pub broker_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive in seconds, 0 selects the default of 400
    #[serde(default)]
    pub keep_alive_secs: u16,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            host: None,
            port: None,
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: 0,
            clean_session: default_clean_session(),
        }
    }
}

/// Session tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Retry protocol errors the classifier does not recognize
    #[serde(default = "default_retry_unknown_errors")]
    pub retry_unknown_errors: bool,
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sync_interval_ms: default_sync_interval_ms(),
            retry_unknown_errors: default_retry_unknown_errors(),
            send_buffer_size: default_send_buffer_size(),
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

/// A topic to subscribe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

fn default_clean_session() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_sync_interval_ms() -> u64 {
    100
}

fn default_retry_unknown_errors() -> bool {
    true
}

fn default_send_buffer_size() -> usize {
    2048
}

fn default_recv_buffer_size() -> usize {
    1024
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file, leaving validation to the caller
    pub fn read_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration without validating it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve_endpoint()?;
        HealthMonitor::validate_settings(&self.session_settings())
            .map_err(ConfigError::InvalidConfig)?;

        for subscription in &self.subscriptions {
            if subscription.topic.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "subscription topic cannot be empty".to_string(),
                ));
            }
            if subscription.qos > 2 {
                return Err(ConfigError::InvalidConfig(format!(
                    "subscription '{}' has invalid qos {}",
                    subscription.topic, subscription.qos
                )));
            }
        }
        Ok(())
    }

    /// Broker host and optional port, from `host`/`port` or `broker_url`
    pub fn resolve_endpoint(&self) -> Result<(String, Option<String>), ConfigError> {
        if let Some(host) = self.mqtt.host.as_ref().filter(|h| !h.is_empty()) {
            return Ok((host.clone(), self.mqtt.port.map(|p| p.to_string())));
        }

        let broker_url = self.mqtt.broker_url.as_ref().ok_or_else(|| {
            ConfigError::InvalidConfig("either mqtt.host or mqtt.broker_url is required".to_string())
        })?;
        parse_broker_url(broker_url)
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get MQTT password, failing if the configured variable is unset
    pub fn require_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.mqtt.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Connect parameters for [`crate::transport::mqtt::MqttSession::connect`]
    pub fn to_mqtt_config(&self) -> Result<MqttConfig, ConfigError> {
        let (host, port) = self.resolve_endpoint()?;
        Ok(MqttConfig {
            host,
            port,
            client_id: self.mqtt.client_id.clone(),
            username: self.get_mqtt_username(),
            password: self.get_mqtt_password(),
            keep_alive_secs: self.mqtt.keep_alive_secs,
            clean_session: self.mqtt.clean_session,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        let session = &self.session;
        SessionSettings {
            max_retries: session.max_retries,
            backoff: BackoffConfig {
                base_delay_ms: session.base_delay_ms,
                max_delay_ms: session.max_delay_ms,
            },
            connect_timeout: Duration::from_secs(session.connect_timeout_secs),
            sync_interval: Duration::from_millis(session.sync_interval_ms),
            classifier: ClassifierPolicy {
                retry_unknown: session.retry_unknown_errors,
            },
            buffers: BufferSizes {
                send: session.send_buffer_size,
                recv: session.recv_buffer_size,
            },
        }
    }
}

fn parse_broker_url(broker_url: &str) -> Result<(String, Option<String>), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBrokerUrl(format!("{broker_url}: {reason}"));
    let url = Url::parse(broker_url).map_err(|e| invalid(&e.to_string()))?;

    match url.scheme() {
        "mqtt" | "tcp" => {}
        "mqtts" | "ssl" => return Err(invalid("TLS is not supported")),
        other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => return Err(invalid("missing host")),
    };

    Ok((host, url.port().map(|p| p.to_string())))
}
