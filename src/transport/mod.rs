//! Transport layer for the MQTT session
//!
//! [`socket`] opens raw TCP connections to the broker. [`mqtt`] owns the session that
//! runs the protocol over them and keeps it alive.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod mqtt;
pub mod socket;

pub use socket::{Connector, TcpConnector};

/// Byte stream the protocol library runs over
///
/// Implemented for every tokio stream, so tests can hand the session an in-memory
/// duplex pipe instead of a TCP socket.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Owned, type-erased connection handed to the protocol library
pub type BoxedStream = Box<dyn AsyncStream>;
