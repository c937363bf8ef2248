//! Background sync loop
//!
//! Pumps the protocol client on a fixed interval while connected. When the connection
//! is lost it asks [`HealthMonitor`] whether to retry, waits out the backoff and
//! re-establishes the connection from the saved config. The loop ends on a stop
//! request or when reconnection gives up, leaving the session in `ReconnectFailed`.

use super::client::SessionShared;
use super::connection::SessionStatus;
use super::health_monitor::{HealthMonitor, ReconnectionDecision};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Handle to a running sync loop
pub(crate) struct SyncLoopHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub(crate) fn spawn(shared: Arc<SessionShared>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = crate::session_span!(max_retries = shared.settings.max_retries);
        let handle = tokio::spawn(run(shared, shutdown_rx).instrument(span));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Request a stop; observed at the next checkpoint
    pub(crate) fn signal(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loop to finish
    pub(crate) async fn join(self) {
        self.signal();
        match self.handle.await {
            Ok(()) => debug!("Sync loop joined"),
            Err(e) if e.is_cancelled() => debug!("Sync loop was cancelled"),
            Err(e) => error!("Sync loop task failed: {}", e),
        }
    }

    pub(crate) fn abort(self) {
        self.signal();
        self.handle.abort();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CycleOutcome {
    /// Nothing more to do this cycle; sleep before the next
    Idle,
    /// A reconnect just succeeded; go straight to the next cycle
    Reconnected,
    /// Leave the loop
    Stop,
}

async fn run(shared: Arc<SessionShared>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(
        max_retries = shared.settings.max_retries,
        max_total_backoff_ms =
            HealthMonitor::calculate_max_total_backoff(&shared.settings).as_millis() as u64,
        "MQTT sync loop started"
    );
    let sync_interval = shared.settings.sync_interval;

    loop {
        let shutdown = *shutdown_rx.borrow();
        if shutdown {
            break;
        }

        match cycle(&shared, &mut shutdown_rx).await {
            CycleOutcome::Reconnected => continue,
            CycleOutcome::Stop => break,
            CycleOutcome::Idle => {
                if !interruptible_sleep(&mut shutdown_rx, sync_interval).await {
                    break;
                }
            }
        }
    }

    info!("MQTT sync loop stopped");
}

async fn cycle(shared: &SessionShared, shutdown_rx: &mut watch::Receiver<bool>) -> CycleOutcome {
    let (saved, handler, delay) = {
        let mut state = shared.state.lock().await;
        let shutdown = *shutdown_rx.borrow();
        if shutdown {
            return CycleOutcome::Stop;
        }

        if state.status == SessionStatus::Connected {
            match state.pump().await {
                Ok(()) => return CycleOutcome::Idle,
                Err(e) => state.mark_lost(&e),
            }
        }

        let decision = HealthMonitor::should_attempt_reconnection(
            state.last_code,
            state.retry_count,
            &shared.settings,
            shutdown,
        );
        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                let Some(saved) = state.saved_config.clone() else {
                    state.set_status(SessionStatus::ReconnectFailed, Some("no saved config"));
                    return CycleOutcome::Stop;
                };
                state.retry_count = attempt;
                state.notify();
                info!(
                    attempt,
                    max_retries = shared.settings.max_retries,
                    delay_ms,
                    "Scheduling MQTT reconnect"
                );
                (saved, state.handler.clone(), Duration::from_millis(delay_ms))
            }
            ReconnectionDecision::AbortShutdownRequested => return CycleOutcome::Stop,
            ReconnectionDecision::AbortNonRetriable(code) => {
                let reason = format!("non-retriable error: {code}");
                state.set_status(SessionStatus::ReconnectFailed, Some(&reason));
                return CycleOutcome::Stop;
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("{} reconnect attempts exhausted", shared.settings.max_retries);
                state.set_status(SessionStatus::ReconnectFailed, Some(&reason));
                return CycleOutcome::Stop;
            }
        }
    };

    if !interruptible_sleep(shutdown_rx, delay).await {
        return CycleOutcome::Stop;
    }

    {
        let mut state = shared.state.lock().await;
        let shutdown = *shutdown_rx.borrow();
        if shutdown {
            return CycleOutcome::Stop;
        }
        state.drop_connection();
        state.set_status(SessionStatus::Connecting, None);
    }

    let result = tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown_rx) => return CycleOutcome::Stop,
        result = shared.establish(&saved, handler) => result,
    };

    let mut state = shared.state.lock().await;
    let shutdown = *shutdown_rx.borrow();
    if shutdown {
        return CycleOutcome::Stop;
    }

    match result {
        Ok(client) => {
            info!(endpoint = %saved.endpoint(), "MQTT reconnected");
            state.install_connection(client);
            state.restore_subscriptions();
            CycleOutcome::Reconnected
        }
        Err(e) => {
            warn!(endpoint = %saved.endpoint(), error = %e, "MQTT reconnect attempt failed");
            state.record_error(&e);
            state.set_status(SessionStatus::Disconnected, Some(&e.to_string()));
            CycleOutcome::Idle
        }
    }
}

/// Sleep for `duration` unless a stop is requested first.
/// Returns true if the sleep completed, false if shutdown requested.
pub(crate) async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown_rx) => {
            debug!("Shutdown signal received during sleep");
            false
        }
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Resolve once a stop is requested or the handle is gone
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        let shutdown = *shutdown_rx.borrow_and_update();
        if shutdown {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
