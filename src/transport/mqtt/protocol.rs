//! Boundary to the MQTT protocol library
//!
//! The session manager never encodes packets itself. It drives a [`ProtocolClient`]
//! through its lifecycle calls and inspects the client's sticky error code. A
//! [`ProtocolFactory`] plays the role of the library's `init` entry point: it takes
//! ownership of a freshly opened socket and returns a client bound to it.

use crate::transport::mqtt::message_handler::MessageHandler;
use crate::transport::BoxedStream;
use async_trait::async_trait;
use rumqttc::mqttbytes::QoS;
use std::fmt;
use std::time::Duration;

/// Error codes reported by the protocol library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorCode {
    /// Reading from or writing to the socket failed
    SocketError,
    /// The peer closed the connection
    ConnectionClosed,
    /// An outbound packet does not fit in the send buffer
    SendBufferFull,
    /// An inbound packet is larger than the receive buffer
    RecvBufferTooSmall,
    /// The broker acknowledged a packet id we never sent
    AckOfUnknown,
    /// No PINGRESP arrived within the keep-alive interval
    KeepAliveTimeout,
    /// The broker rejected the CONNECT handshake
    ConnectionRefused,
    /// The broker rejected a SUBSCRIBE
    SubscribeFailed,
    /// An operation was issued before the CONNECT handshake
    ConnectNotCalled,
    /// The broker sent bytes that do not decode as a client-bound packet
    MalformedPacket,
    /// A library code this crate does not map
    Unknown(i32),
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorCode::SocketError => write!(f, "socket error"),
            ProtocolErrorCode::ConnectionClosed => write!(f, "connection closed by peer"),
            ProtocolErrorCode::SendBufferFull => write!(f, "send buffer is full"),
            ProtocolErrorCode::RecvBufferTooSmall => write!(f, "receive buffer too small"),
            ProtocolErrorCode::AckOfUnknown => write!(f, "acknowledgment of unknown packet"),
            ProtocolErrorCode::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            ProtocolErrorCode::ConnectionRefused => write!(f, "connection refused by broker"),
            ProtocolErrorCode::SubscribeFailed => write!(f, "subscribe rejected by broker"),
            ProtocolErrorCode::ConnectNotCalled => write!(f, "connect not called"),
            ProtocolErrorCode::MalformedPacket => write!(f, "malformed packet"),
            ProtocolErrorCode::Unknown(code) => write!(f, "unknown error ({code})"),
        }
    }
}

/// Result of a protocol library call
pub type ProtocolResult = Result<(), ProtocolErrorCode>;

/// Arguments of the CONNECT handshake
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Client identifier. `None` connects anonymously with an empty id.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

/// Capacities of the client's send and receive buffers in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub send: usize,
    pub recv: usize,
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self {
            send: 2048,
            recv: 1024,
        }
    }
}

/// A protocol client bound to one socket.
///
/// `publish`, `subscribe` and `unsubscribe` only queue packets; queued data leaves the
/// process on the next [`ProtocolClient::sync`]. Once a call fails the client keeps the
/// code in [`ProtocolClient::error`] and every later call fails with it.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send CONNECT and wait up to `timeout` for the broker's CONNACK
    async fn connect(&mut self, options: &ConnectOptions, timeout: Duration) -> ProtocolResult;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> ProtocolResult;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> ProtocolResult;

    fn unsubscribe(&mut self, topic: &str) -> ProtocolResult;

    /// Queue DISCONNECT and flush everything still buffered, within a bounded wait
    async fn disconnect(&mut self) -> ProtocolResult;

    /// One sync cycle without blocking: read incoming packets, service keep-alive and
    /// write whatever queued data the socket accepts
    async fn sync(&mut self) -> ProtocolResult;

    /// Sticky internal error, `None` while the client is healthy
    fn error(&self) -> Option<ProtocolErrorCode>;
}

/// Entry point of the protocol library
pub trait ProtocolFactory: Send + Sync {
    /// Bind a new client to `stream`. Received messages are passed to `handler`.
    fn init(
        &self,
        stream: BoxedStream,
        buffers: BufferSizes,
        handler: Option<MessageHandler>,
    ) -> Box<dyn ProtocolClient>;
}
