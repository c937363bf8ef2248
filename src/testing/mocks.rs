//! Mock implementations for testing
//!
//! A [`MockBroker`] is a scripted stand-in for the network and the broker. Hand
//! [`MockConnector`] and [`MockProtocolFactory`] built from the same broker to
//! [`MqttSession::with_backends`](crate::transport::mqtt::MqttSession::with_backends),
//! then script failures and inspect what the session did.

use crate::error::{SessionError, SessionResult};
use crate::transport::mqtt::{
    BufferSizes, ConnectOptions, MessageHandler, ProtocolClient, ProtocolErrorCode,
    ProtocolFactory, ProtocolResult,
};
use crate::transport::{BoxedStream, Connector};
use async_trait::async_trait;
use rumqttc::mqttbytes::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A message the session published through the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct MockBrokerState {
    failing_opens: u32,
    failing_handshakes: VecDeque<ProtocolErrorCode>,
    pending_drop: Option<ProtocolErrorCode>,
    failing_publishes: Option<ProtocolErrorCode>,
    deliveries: VecDeque<(String, Vec<u8>)>,
    open_attempts: u32,
    endpoints: Vec<(String, String)>,
    connect_options: Vec<ConnectOptions>,
    buffers: Vec<BufferSizes>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, QoS)>,
    unsubscriptions: Vec<String>,
    disconnects: u32,
    sync_count: u64,
}

/// Scripted broker shared by the mock connector and protocol clients
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` socket opens
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Fail the next CONNECT handshake with `code`
    pub fn fail_next_handshake(&self, code: ProtocolErrorCode) {
        self.lock().failing_handshakes.push_back(code);
    }

    /// Break the live connection: its next sync fails with `code`
    pub fn drop_connection(&self, code: ProtocolErrorCode) {
        self.lock().pending_drop = Some(code);
    }

    /// Fail every publish with `code` until cleared with `None`
    pub fn fail_publishes(&self, code: Option<ProtocolErrorCode>) {
        self.lock().failing_publishes = code;
    }

    /// Queue a message for delivery on the next sync
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.lock()
            .deliveries
            .push_back((topic.to_string(), payload.to_vec()));
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// `(host, port)` of every open attempt
    pub fn endpoints(&self) -> Vec<(String, String)> {
        self.lock().endpoints.clone()
    }

    /// Options of every CONNECT handshake
    pub fn connect_options(&self) -> Vec<ConnectOptions> {
        self.lock().connect_options.clone()
    }

    pub fn buffers(&self) -> Vec<BufferSizes> {
        self.lock().buffers.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.lock().subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.lock().unsubscriptions.clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    pub fn sync_count(&self) -> u64 {
        self.lock().sync_count
    }
}

/// Connector that hands out in-memory streams
#[derive(Debug, Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

impl MockConnector {
    pub fn new(broker: MockBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, host: &str, port: &str, _timeout: Duration) -> SessionResult<BoxedStream> {
        let mut state = self.broker.lock();
        state.open_attempts += 1;
        state
            .endpoints
            .push((host.to_string(), port.to_string()));

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(SessionError::Connect {
                host: host.to_string(),
                port: port.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (stream, _peer) = tokio::io::duplex(64);
        Ok(Box::new(stream))
    }
}

/// Protocol library double backed by a [`MockBroker`]
#[derive(Debug, Clone)]
pub struct MockProtocolFactory {
    broker: MockBroker,
}

impl MockProtocolFactory {
    pub fn new(broker: MockBroker) -> Self {
        Self { broker }
    }
}

impl ProtocolFactory for MockProtocolFactory {
    fn init(
        &self,
        _stream: BoxedStream,
        buffers: BufferSizes,
        handler: Option<MessageHandler>,
    ) -> Box<dyn ProtocolClient> {
        self.broker.lock().buffers.push(buffers);
        Box::new(MockProtocolClient {
            broker: self.broker.clone(),
            handler,
            error: None,
            connected: false,
        })
    }
}

pub struct MockProtocolClient {
    broker: MockBroker,
    handler: Option<MessageHandler>,
    error: Option<ProtocolErrorCode>,
    connected: bool,
}

impl MockProtocolClient {
    fn ready(&self) -> ProtocolResult {
        if let Some(code) = self.error {
            return Err(code);
        }
        if !self.connected {
            return Err(ProtocolErrorCode::ConnectNotCalled);
        }
        Ok(())
    }

    fn fail(&mut self, code: ProtocolErrorCode) -> ProtocolResult {
        self.error = Some(code);
        Err(code)
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn connect(&mut self, options: &ConnectOptions, _timeout: Duration) -> ProtocolResult {
        let refused = {
            let mut state = self.broker.lock();
            state.connect_options.push(options.clone());
            state.failing_handshakes.pop_front()
        };
        if let Some(code) = refused {
            return self.fail(code);
        }
        self.connected = true;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> ProtocolResult {
        self.ready()?;
        let failure = self.broker.lock().failing_publishes;
        if let Some(code) = failure {
            return self.fail(code);
        }
        self.broker.lock().published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> ProtocolResult {
        self.ready()?;
        self.broker
            .lock()
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> ProtocolResult {
        self.ready()?;
        self.broker.lock().unsubscriptions.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) -> ProtocolResult {
        self.ready()?;
        self.broker.lock().disconnects += 1;
        self.connected = false;
        Ok(())
    }

    async fn sync(&mut self) -> ProtocolResult {
        self.ready()?;

        let (dropped, deliveries) = {
            let mut state = self.broker.lock();
            state.sync_count += 1;
            let deliveries: Vec<_> = state.deliveries.drain(..).collect();
            (state.pending_drop.take(), deliveries)
        };
        if let Some(code) = dropped {
            return self.fail(code);
        }

        // Handler runs without the broker lock held
        if let Some(handler) = &self.handler {
            for (topic, payload) in &deliveries {
                handler(topic, payload);
            }
        }
        Ok(())
    }

    fn error(&self) -> Option<ProtocolErrorCode> {
        self.error
    }
}
