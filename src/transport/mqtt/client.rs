//! Impure I/O operations for the MQTT session
//!
//! [`MqttSession`] is the caller-facing Connection Manager. It owns the shared session
//! state, establishes the first connection synchronously and then hands the connection
//! to the background sync loop. Every access to the protocol client, from the caller or
//! from the loop, goes through one mutex.

use super::connection::{qos_from_level, MqttConfig, SavedConfig, SessionSettings, SessionStatus};
use super::health_monitor::HealthMonitor;
use super::message_handler::MessageHandler;
use super::packet_client::PacketClientFactory;
use super::protocol::{ProtocolClient, ProtocolErrorCode, ProtocolFactory, ProtocolResult};
use super::sync_loop::SyncLoopHandle;
use crate::error::{SessionError, SessionResult};
use crate::transport::socket::{Connector, TcpConnector};
use rumqttc::mqttbytes::QoS;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Point-in-time view of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Reconnect attempts since the last successful connection
    pub retry_count: u32,
    /// Sticky error of the protocol client, if it has one
    pub protocol_error: Option<ProtocolErrorCode>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected && self.protocol_error.is_none()
    }
}

/// The single mutable record of a session
pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    /// Protocol client bound to the open socket. Dropping it closes the socket.
    pub(crate) client: Option<Box<dyn ProtocolClient>>,
    pub(crate) saved_config: Option<SavedConfig>,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<String>,
    /// Protocol code of the most recent failure, for the reconnect decision
    pub(crate) last_code: Option<ProtocolErrorCode>,
    pub(crate) handler: Option<MessageHandler>,
    /// Subscriptions re-issued after every automatic reconnect
    pub(crate) subscriptions: Vec<(String, QoS)>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionState {
    fn new(snapshot_tx: watch::Sender<SessionSnapshot>) -> Self {
        Self {
            status: SessionStatus::Uninitialized,
            client: None,
            saved_config: None,
            retry_count: 0,
            last_error: None,
            last_code: None,
            handler: None,
            subscriptions: Vec::new(),
            snapshot_tx,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            retry_count: self.retry_count,
            protocol_error: self.client.as_ref().and_then(|client| client.error()),
            last_error: self.last_error.clone(),
        }
    }

    /// Publish the current snapshot if it changed
    pub(crate) fn notify(&self) {
        debug_assert!(
            self.client.is_none() || self.status.holds_socket(),
            "open socket while {}",
            self.status
        );
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub(crate) fn set_status(&mut self, to: SessionStatus, reason: Option<&str>) {
        if self.status != to {
            HealthMonitor::log_state_transition(self.status, to, reason);
        }
        self.status = to;
        self.notify();
    }

    pub(crate) fn record_error(&mut self, error: &SessionError) {
        debug!(error = %error, "Recording session error");
        self.last_error = Some(error.to_string());
        self.last_code = error.protocol_code();
        self.notify();
    }

    /// Take ownership of a freshly established connection
    pub(crate) fn install_connection(&mut self, client: Box<dyn ProtocolClient>) {
        self.client = Some(client);
        self.retry_count = 0;
        self.last_code = None;
        self.set_status(SessionStatus::Connected, None);
    }

    /// Close the socket, if any
    pub(crate) fn drop_connection(&mut self) {
        if self.client.take().is_some() {
            debug!("Closed MQTT socket");
        }
    }

    /// Record a lost connection: close the socket and mark the session disconnected
    pub(crate) fn mark_lost(&mut self, error: &SessionError) {
        self.record_error(error);
        self.drop_connection();
        self.set_status(SessionStatus::Disconnected, Some(&error.to_string()));
    }

    fn remember_subscription(&mut self, topic: &str, qos: QoS) {
        match self.subscriptions.iter_mut().find(|(t, _)| t == topic) {
            Some(existing) => existing.1 = qos,
            None => self.subscriptions.push((topic.to_string(), qos)),
        }
    }

    fn forget_subscription(&mut self, topic: &str) {
        self.subscriptions.retain(|(t, _)| t != topic);
    }

    /// Queue every remembered subscription on the current connection.
    ///
    /// A failure leaves the client's sticky error set; the next sync reports it.
    pub(crate) fn restore_subscriptions(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        for (topic, qos) in &self.subscriptions {
            if let Err(code) = client.subscribe(topic, *qos) {
                warn!(topic = %topic, error = %code, "Failed to restore subscription");
                return;
            }
            debug!(topic = %topic, "Restored subscription");
        }
    }

    fn begin(&mut self, saved: SavedConfig, handler: Option<MessageHandler>) {
        self.saved_config = Some(saved);
        self.handler = handler;
        self.subscriptions.clear();
        self.retry_count = 0;
        self.last_error = None;
        self.last_code = None;
        self.set_status(SessionStatus::Connecting, None);
    }

    /// Clear everything, including credentials and the last error
    fn reset(&mut self) {
        self.drop_connection();
        self.saved_config = None;
        self.handler = None;
        self.subscriptions.clear();
        self.retry_count = 0;
        self.last_error = None;
        self.last_code = None;
        self.set_status(SessionStatus::Uninitialized, None);
    }

    /// Run one sync cycle of the protocol client
    pub(crate) async fn pump(&mut self) -> SessionResult<()> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SessionError::protocol(ProtocolErrorCode::SocketError, "No open socket"))?;

        let code = match client.sync().await {
            Err(code) => Some(code),
            Ok(()) => client.error(),
        };

        match code {
            Some(code) => Err(SessionError::protocol(code, "MQTT sync failed")),
            None => {
                self.notify();
                Ok(())
            }
        }
    }
}

/// State shared between the session handle and its sync loop
pub(crate) struct SessionShared {
    pub(crate) state: Mutex<SessionState>,
    connector: Arc<dyn Connector>,
    factory: Arc<dyn ProtocolFactory>,
    pub(crate) settings: SessionSettings,
}

impl SessionShared {
    /// Open a socket and run the handshake against `saved`.
    ///
    /// On failure the partially set up client is dropped, which closes its socket.
    pub(crate) async fn establish(
        &self,
        saved: &SavedConfig,
        handler: Option<MessageHandler>,
    ) -> SessionResult<Box<dyn ProtocolClient>> {
        let stream = self
            .connector
            .open(&saved.host, &saved.port, self.settings.connect_timeout)
            .await?;

        let mut client = self.factory.init(stream, self.settings.buffers, handler);
        client
            .connect(&saved.options, self.settings.connect_timeout)
            .await
            .map_err(|code| SessionError::protocol(code, "MQTT connect failed"))?;

        Ok(client)
    }
}

/// A persistent MQTT session with autonomous reconnection
pub struct MqttSession {
    shared: Arc<SessionShared>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    sync_loop: Option<SyncLoopHandle>,
}

impl MqttSession {
    /// Session over TCP using the built-in protocol client
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_backends(
            settings,
            Arc::new(TcpConnector),
            Arc::new(PacketClientFactory),
        )
    }

    /// Session with a custom socket connector and protocol library
    pub fn with_backends(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let shared = SessionShared {
            state: Mutex::new(SessionState::new(snapshot_tx)),
            connector,
            factory,
            settings,
        };

        Self {
            shared: Arc::new(shared),
            snapshot_rx,
            sync_loop: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Connect to the broker and start the sync loop.
    ///
    /// Any prior session is torn down first. The socket and the CONNECT handshake are
    /// complete when this returns `Ok`.
    pub async fn connect(
        &mut self,
        config: &MqttConfig,
        handler: Option<MessageHandler>,
    ) -> SessionResult<()> {
        config.validate()?;

        self.disconnect().await;

        let saved = SavedConfig::from_config(config);
        let mut state = self.shared.state.lock().await;
        state.begin(saved.clone(), handler.clone());

        info!(endpoint = %saved.endpoint(), client_id = ?saved.options.client_id, "Connecting to MQTT broker");
        match self.shared.establish(&saved, handler).await {
            Ok(client) => {
                state.install_connection(client);
                drop(state);
                self.sync_loop = Some(SyncLoopHandle::spawn(self.shared.clone()));
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %saved.endpoint(), error = %e, "MQTT connect failed");
                state.record_error(&e);
                state.drop_connection();
                state.saved_config = None;
                state.handler = None;
                state.set_status(SessionStatus::Disconnected, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Queue a message for the broker. QoS outside 0-2 publishes at QoS 0.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> SessionResult<()> {
        let qos = qos_from_level(qos);
        let _state = self
            .with_client("publish", topic, |client| {
                client.publish(topic, payload, qos, retain)
            })
            .await?;
        Ok(())
    }

    /// Subscribe to `topic`. QoS above 2 is clamped to 0.
    ///
    /// The subscription is re-issued after every automatic reconnect.
    pub async fn subscribe(&self, topic: &str, qos: u8) -> SessionResult<()> {
        let qos = qos_from_level(qos);
        let mut state = self
            .with_client("subscribe", topic, |client| client.subscribe(topic, qos))
            .await?;
        state.remember_subscription(topic, qos);
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        let mut state = self
            .with_client("unsubscribe", topic, |client| client.unsubscribe(topic))
            .await?;
        state.forget_subscription(topic);
        Ok(())
    }

    /// Run `call` against the connected client; on success the state stays locked
    async fn with_client<F>(
        &self,
        operation: &str,
        topic: &str,
        call: F,
    ) -> SessionResult<MutexGuard<'_, SessionState>>
    where
        F: FnOnce(&mut dyn ProtocolClient) -> ProtocolResult,
    {
        let mut state = self.shared.state.lock().await;
        let _span = crate::mqtt_span!(operation, topic).entered();
        let status = state.status;
        if status != SessionStatus::Connected {
            return Err(SessionError::NotConnected { status });
        }
        if topic.is_empty() {
            return Err(SessionError::InvalidTopic);
        }

        let client = match state.client.as_mut() {
            Some(client) => client,
            None => return Err(SessionError::NotConnected { status }),
        };

        let code = match call(&mut **client) {
            Ok(()) => {
                debug!(operation, topic, "MQTT operation queued");
                return Ok(state);
            }
            Err(code) => code,
        };
        let broken = client.error().is_some();

        let error = SessionError::protocol(code, format!("MQTT {operation} failed"));
        warn!(operation, topic, error = %error, "MQTT operation failed");
        if broken {
            // The sync loop picks the loss up on its next cycle
            state.mark_lost(&error);
        } else {
            state.record_error(&error);
        }
        Err(error)
    }

    /// True while connected and the protocol client reports no error
    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshot_rx.borrow().last_error.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot_rx.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that observes every state change of this session
    pub fn status_receiver(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Tear the session down. A no-op when there is nothing to tear down.
    ///
    /// Returns once the sync loop has fully stopped.
    pub async fn disconnect(&mut self) {
        if !self.status().is_initialized() && self.sync_loop.is_none() {
            return;
        }

        if let Some(sync_loop) = &self.sync_loop {
            sync_loop.signal();
        }

        {
            let mut state = self.shared.state.lock().await;
            if state.status == SessionStatus::Connected {
                if let Some(client) = state.client.as_mut() {
                    if let Err(code) = client.disconnect().await {
                        debug!(error = %code, "Ignoring failed MQTT disconnect");
                    }
                }
            }
        }

        if let Some(sync_loop) = self.sync_loop.take() {
            sync_loop.join().await;
        }

        self.shared.state.lock().await.reset();
        info!("MQTT session disconnected");
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // No async in Drop; call disconnect() for a graceful shutdown
        if let Some(sync_loop) = self.sync_loop.take() {
            sync_loop.abort();
        }
    }
}
