//! Socket Connector
//!
//! Resolves `host:port`, then tries every resolved address in resolver order until one
//! completes the TCP handshake within the timeout. A candidate that fails is dropped
//! (closing its socket) before the next one is tried.

use crate::error::{SessionError, SessionResult};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Opens connections to the broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &str, port: &str, timeout: Duration) -> SessionResult<BoxedStream>;
}

/// [`Connector`] backed by plain TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, host: &str, port: &str, timeout: Duration) -> SessionResult<BoxedStream> {
        let stream = open_socket(host, port, timeout).await?;
        Ok(Box::new(stream))
    }
}

/// Open a TCP connection to `host:port`, waiting at most `timeout` per candidate address.
///
/// Accepts IPv4 and IPv6 literals as well as names. Returns
/// [`SessionError::Resolution`] when nothing resolves and [`SessionError::Connect`] with
/// the last observed cause when every candidate fails.
pub async fn open_socket(host: &str, port: &str, timeout: Duration) -> SessionResult<TcpStream> {
    let resolution_error = |reason: String| SessionError::Resolution {
        host: host.to_string(),
        port: port.to_string(),
        reason,
    };

    let port_number: u16 = port
        .parse()
        .map_err(|_| resolution_error(format!("invalid port '{port}'")))?;

    let candidates: Vec<SocketAddr> = lookup_host((host, port_number))
        .await
        .map_err(|e| resolution_error(e.to_string()))?
        .collect();

    if candidates.is_empty() {
        return Err(resolution_error("no addresses found".to_string()));
    }

    let mut last_cause = String::new();
    for addr in candidates {
        match connect_candidate(addr, timeout).await {
            Ok(stream) => {
                debug!(%addr, "Socket connected");
                return Ok(stream);
            }
            Err(cause) => {
                warn!(%addr, error = %cause, "Connection attempt failed");
                last_cause = cause;
            }
        }
    }

    Err(SessionError::Connect {
        host: host.to_string(),
        port: port.to_string(),
        reason: last_cause,
    })
}

async fn connect_candidate(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, String> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| e.to_string())?;

    let stream = match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("timed out after {}ms", timeout.as_millis())),
    };

    // A writable socket can still carry a pending error
    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(e)) | Err(e) => return Err(e.to_string()),
    }

    stream.set_nodelay(true).map_err(|e| e.to_string())?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_socket_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = open_socket("127.0.0.1", &port, Duration::from_secs(2)).await;

        assert!(stream.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_port_is_resolution_error() {
        let result = open_socket("127.0.0.1", "not-a-port", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::Resolution { .. })));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let result = open_socket("127.0.0.1", &port, Duration::from_secs(2)).await;
        match result {
            Err(SessionError::Connect { host, reason, .. }) => {
                assert_eq!(host, "127.0.0.1");
                assert!(!reason.is_empty());
            }
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_connector_boxes_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let _accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let stream = TcpConnector
            .open("127.0.0.1", &port, Duration::from_secs(2))
            .await;
        assert!(stream.is_ok());
    }
}
