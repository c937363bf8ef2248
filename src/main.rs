//! dx-mqtt - Main Entry Point
//!
//! Command-line front end for the persistent MQTT session: watch topics, publish a
//! single message or inspect the effective configuration.

use clap::{Args, Parser, Subcommand};
use dx_mqtt::config::AppConfig;
use dx_mqtt::observability::{init_logging, parse_level, LogFormat};
use dx_mqtt::transport::mqtt::ReceivedMessage;
use dx_mqtt::{channel_handler, MqttConfig, MqttSession, SessionStatus};
use std::path::PathBuf;
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

const SIGHUP: i64 = 1;
const SIGINT: i64 = 2;
const SIGTERM: i64 = 15;

/// Exit code when the session gave up reconnecting
const EXIT_RECONNECT_FAILED: i32 = 2;

/// Persistent MQTT session for IoT devices
#[derive(Parser)]
#[command(name = "dx-mqtt")]
#[command(about = "Persistent MQTT session with autonomous reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Broker settings that override the configuration file
#[derive(Args)]
struct BrokerArgs {
    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", global = true)]
    host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", global = true)]
    port: Option<u16>,

    /// MQTT client identifier
    #[arg(long, env = "MQTT_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME", global = true)]
    username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print received messages until interrupted
    Monitor {
        /// Topics to subscribe in addition to the configured ones
        topics: Vec<String>,

        /// QoS for the command-line topics
        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        /// Receive queue capacity
        #[arg(long, default_value_t = 256)]
        queue: usize,
    },
    /// Publish one message and exit
    Publish {
        topic: String,
        message: String,

        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        #[arg(short, long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);
    info!("Starting dx-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config, &cli.broker) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Monitor { topics, qos, queue } => {
            run_monitor(&config, &cli.broker, &topics, qos, queue).await
        }
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(&config, &cli.broker, &topic, &message, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    match result {
        Ok(code) => {
            info!("Application shutdown complete");
            process::exit(code);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            process::exit(1);
        }
    }
}

fn init_cli_logging(verbose: u8) {
    let level = match verbose {
        0 => parse_level(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string())),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()));
    let include_spans = std::env::var("LOG_SPANS").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

    init_logging(level, format, include_spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
    broker: &BrokerArgs,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            AppConfig::read_from_file(path)?
        }
        None => {
            let default_paths = ["dx-mqtt.toml", "config/dx-mqtt.toml"];
            match default_paths.iter().map(PathBuf::from).find(|p| p.exists()) {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    AppConfig::read_from_file(&path)?
                }
                None => AppConfig::default(),
            }
        }
    };

    if let Some(host) = &broker.host {
        config.mqtt.host = Some(host.clone());
    }
    if let Some(port) = broker.port {
        config.mqtt.port = Some(port);
    }
    if let Some(client_id) = &broker.client_id {
        config.mqtt.client_id = Some(client_id.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Connect parameters from the file, with command-line credentials taking precedence
fn mqtt_config(
    config: &AppConfig,
    broker: &BrokerArgs,
) -> Result<MqttConfig, Box<dyn std::error::Error>> {
    let mut mqtt = config.to_mqtt_config()?;
    if broker.username.is_some() {
        mqtt.username = broker.username.clone();
    }
    if broker.password.is_some() {
        mqtt.password = broker.password.clone();
    } else {
        mqtt.password = config.require_mqtt_password()?;
    }
    Ok(mqtt)
}

async fn run_monitor(
    config: &AppConfig,
    broker: &BrokerArgs,
    topics: &[String],
    qos: u8,
    queue: usize,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mqtt = mqtt_config(config, broker)?;
    let (handler, mut messages) = channel_handler(queue);

    let mut session = MqttSession::new(config.session_settings());
    session.connect(&mqtt, Some(handler)).await?;

    let subscriptions = config
        .subscriptions
        .iter()
        .map(|s| (s.topic.as_str(), s.qos))
        .chain(topics.iter().map(|t| (t.as_str(), qos)));
    let mut subscribed = 0;
    for (topic, qos) in subscriptions {
        if let Err(e) = session.subscribe(topic, qos).await {
            session.disconnect().await;
            return Err(e.into());
        }
        info!(topic, qos, "Subscribed");
        subscribed += 1;
    }
    if subscribed == 0 {
        warn!("No topics to monitor; pass topics or add [[subscriptions]] to the config");
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut status = session.status_receiver();

    let code = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            clamp_exit_code(128 + SIGINT)
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            clamp_exit_code(128 + SIGTERM)
        }
        _ = sighup.recv() => {
            info!("Received SIGHUP, shutting down gracefully...");
            clamp_exit_code(128 + SIGHUP)
        }
        failed = status.wait_for(|s| s.status == SessionStatus::ReconnectFailed) => {
            let reason = failed.ok().and_then(|s| s.last_error.clone());
            error!(reason = ?reason, "MQTT connection permanently lost");
            EXIT_RECONNECT_FAILED
        }
        _ = print_messages(&mut messages) => 0,
    };

    session.disconnect().await;
    Ok(code)
}

async fn print_messages(messages: &mut mpsc::Receiver<ReceivedMessage>) {
    while let Some(message) = messages.recv().await {
        println!("{} {}", message.topic, message.payload_str());
    }
}

async fn run_publish(
    config: &AppConfig,
    broker: &BrokerArgs,
    topic: &str,
    message: &str,
    qos: u8,
    retain: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mqtt = mqtt_config(config, broker)?;
    let mut session = MqttSession::new(config.session_settings());
    session.connect(&mqtt, None).await?;

    let result = session.publish(topic, message.as_bytes(), qos, retain).await;
    session.disconnect().await;

    result?;
    info!(topic, bytes = message.len(), "Published");
    Ok(0)
}

fn handle_config_command(config: &AppConfig, show: bool) -> Result<i32, Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_toml_string()?);
    }

    info!("Configuration validation complete");
    Ok(0)
}

/// Clamp a process exit code to the 0-255 range the OS reports
fn clamp_exit_code(code: i64) -> i32 {
    code.clamp(0, 255) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_mqtt::ConfigError;

    #[test]
    fn test_clamp_exit_code() {
        assert_eq!(clamp_exit_code(0), 0);
        assert_eq!(clamp_exit_code(130), 130);
        assert_eq!(clamp_exit_code(-1), 0);
        assert_eq!(clamp_exit_code(300), 255);
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(clamp_exit_code(128 + SIGINT), 130);
        assert_eq!(clamp_exit_code(128 + SIGTERM), 143);
    }

    #[test]
    fn test_cli_parses_monitor() {
        let cli = Cli::try_parse_from(["dx-mqtt", "--host", "broker.local", "monitor", "a/#", "-q", "1"])
            .unwrap();
        assert_eq!(cli.broker.host.as_deref(), Some("broker.local"));
        match cli.command {
            Commands::Monitor { topics, qos, queue } => {
                assert_eq!(topics, vec!["a/#".to_string()]);
                assert_eq!(qos, 1);
                assert_eq!(queue, 256);
            }
            _ => panic!("expected monitor"),
        }
    }

    #[test]
    fn test_cli_overrides_apply_to_config() {
        let broker = BrokerArgs {
            host: Some("override.local".to_string()),
            port: Some(1884),
            client_id: Some("cli".to_string()),
            username: None,
            password: None,
        };

        let missing = load_configuration(&Some(PathBuf::from("/nonexistent/dx.toml")), &broker)
            .err()
            .and_then(|e| e.downcast::<ConfigError>().ok());
        assert!(matches!(missing.as_deref(), Some(ConfigError::FileRead(_))));

        let config = load_configuration(&None, &broker).unwrap();
        let (host, port) = config.resolve_endpoint().unwrap();
        assert_eq!(host, "override.local");
        assert_eq!(port.as_deref(), Some("1884"));
        assert_eq!(config.mqtt.client_id.as_deref(), Some("cli"));
    }
}
