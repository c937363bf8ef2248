//! Pure health monitoring and reconnection logic for the MQTT session
//!
//! This module contains the error classifier, the backoff calculator and the
//! reconnection decision. Nothing here performs I/O or holds state.

use super::connection::{SessionSettings, SessionStatus};
use super::protocol::ProtocolErrorCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl BackoffConfig {
    /// `min(base * 2^attempt, max)`, saturating instead of overflowing
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}

/// Coarse class of a protocol error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The link broke; a fresh socket is likely to help
    Transport,
    /// The broker rejected us; retrying with the same config will not help
    Authorization,
    /// Anything this crate does not map
    Unrecognized,
}

/// Tunable part of the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierPolicy {
    /// Whether unrecognized codes are retried. Retries stay bounded by `max_retries`.
    pub retry_unknown: bool,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            retry_unknown: true,
        }
    }
}

/// Maps protocol error codes to retriable or fatal
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn class_of(code: ProtocolErrorCode) -> ErrorClass {
        match code {
            ProtocolErrorCode::SocketError
            | ProtocolErrorCode::ConnectionClosed
            | ProtocolErrorCode::SendBufferFull
            | ProtocolErrorCode::RecvBufferTooSmall
            | ProtocolErrorCode::AckOfUnknown
            | ProtocolErrorCode::KeepAliveTimeout => ErrorClass::Transport,
            ProtocolErrorCode::ConnectionRefused | ProtocolErrorCode::SubscribeFailed => {
                ErrorClass::Authorization
            }
            ProtocolErrorCode::ConnectNotCalled
            | ProtocolErrorCode::MalformedPacket
            | ProtocolErrorCode::Unknown(_) => ErrorClass::Unrecognized,
        }
    }

    /// Classification under the default policy
    pub fn is_retriable(code: ProtocolErrorCode) -> bool {
        Self::classify(code, ClassifierPolicy::default())
    }

    pub fn classify(code: ProtocolErrorCode, policy: ClassifierPolicy) -> bool {
        match Self::class_of(code) {
            ErrorClass::Transport => true,
            ErrorClass::Authorization => false,
            ErrorClass::Unrecognized => policy.retry_unknown,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - the last error will not heal by retrying
    AbortNonRetriable(ProtocolErrorCode),
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Pure reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what the sync loop does after the connection is found lost.
    ///
    /// `last_code` is the protocol code of the most recent failure, `None` when it had
    /// none (treated as retriable). `retry_count` counts attempts since the last
    /// successful connection.
    pub fn should_attempt_reconnection(
        last_code: Option<ProtocolErrorCode>,
        retry_count: u32,
        settings: &SessionSettings,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(code) = last_code {
            if !ErrorClassifier::classify(code, settings.classifier) {
                return ReconnectionDecision::AbortNonRetriable(code);
            }
        }

        if retry_count >= settings.max_retries {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt: retry_count + 1,
            delay_ms: settings.backoff.delay_ms(retry_count),
        }
    }

    /// Total backoff time spent before giving up, ignoring connect time
    pub fn calculate_max_total_backoff(settings: &SessionSettings) -> Duration {
        let total = (0..settings.max_retries)
            .map(|attempt| settings.backoff.delay_ms(attempt))
            .fold(0u64, u64::saturating_add);
        Duration::from_millis(total)
    }

    /// Validate session tunables
    pub fn validate_settings(settings: &SessionSettings) -> Result<(), String> {
        if settings.backoff.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0".to_string());
        }
        if settings.backoff.max_delay_ms < settings.backoff.base_delay_ms {
            return Err("max_delay_ms must not be less than base_delay_ms".to_string());
        }
        if settings.sync_interval.is_zero() {
            return Err("sync_interval must be greater than 0".to_string());
        }
        if settings.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        if settings.buffers.send == 0 || settings.buffers.recv == 0 {
            return Err("buffer sizes must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Log a status transition
    pub fn log_state_transition(from: SessionStatus, to: SessionStatus, reason: Option<&str>) {
        let reason = reason.unwrap_or("none");
        match (from, to) {
            (SessionStatus::Connecting, SessionStatus::Connected) => {
                info!("MQTT connection established successfully");
            }
            (SessionStatus::Connected, SessionStatus::Disconnected) => {
                warn!(reason, "MQTT connection lost");
            }
            (_, SessionStatus::ReconnectFailed) => {
                error!(reason, "MQTT reconnection permanently failed");
            }
            _ => {
                debug!("MQTT session state: {} -> {}", from, to);
            }
        }
    }
}
