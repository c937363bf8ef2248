//! End-to-end tests over loopback TCP
//!
//! A fake broker on a `TcpListener` speaks raw MQTT 3.1.1 bytes, so the real socket
//! connector and packet client are exercised without an external broker.


use dx_mqtt::transport::mqtt::{
    channel_handler, MqttConfig, MqttSession, ProtocolErrorCode, SessionStatus,
};
use std::time::Duration;
use test_helpers::{fast_settings, wait_for_status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

/// Read one packet: `(fixed header byte, body)`
async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = stream.read_u8().await.unwrap();
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.unwrap();
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// QoS 0 PUBLISH frame from broker to client
fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + payload.len();
    assert!(remaining < 128);
    let mut frame = vec![0x30, remaining as u8];
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

#[tokio::test]
async fn test_full_session_over_tcp() {
    let (listener, port) = bind().await;

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (header, connect) = read_packet(&mut stream).await;
        assert_eq!(header, 0x10);
        assert!(contains(&connect, b"MQTT"));
        assert!(contains(&connect, b"sensor-12"));
        assert!(contains(&connect, b"device"));
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();

        let (header, subscribe) = read_packet(&mut stream).await;
        assert_eq!(header, 0x82);
        assert!(contains(&subscribe, b"sensors/temp"));
        let suback = [0x90, 0x03, subscribe[0], subscribe[1], 0x00];
        stream.write_all(&suback).await.unwrap();
        stream
            .write_all(&publish_frame("sensors/temp", b"21.5"))
            .await
            .unwrap();

        let (header, publish) = read_packet(&mut stream).await;
        assert_eq!(header & 0xF0, 0x30);
        assert!(contains(&publish, b"status"));
        assert!(contains(&publish, b"online"));

        let (header, body) = read_packet(&mut stream).await;
        assert_eq!(header, 0xE0);
        assert!(body.is_empty());
    });

    let mut session = MqttSession::new(fast_settings());
    let (handler, mut messages) = channel_handler(8);
    let config = MqttConfig::new("127.0.0.1")
        .with_port(port)
        .with_client_id("sensor-12")
        .with_credentials("device", "secret")
        .with_keep_alive(60);

    session.connect(&config, Some(handler)).await.unwrap();
    assert!(session.is_connected());
    session.subscribe("sensors/temp", 0).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "sensors/temp");
    assert_eq!(message.payload_str(), "21.5");

    session.publish("status", b"online", 0, false).await.unwrap();
    session.disconnect().await;

    tokio::time::timeout(Duration::from_secs(5), broker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Uninitialized);
}

#[tokio::test]
async fn test_broker_refusal_over_tcp() {
    let (listener, port) = bind().await;

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await;
        stream.write_all(&CONNACK_NOT_AUTHORIZED).await.unwrap();
    });

    let mut session = MqttSession::new(fast_settings());
    let err = session
        .connect(&MqttConfig::new("127.0.0.1").with_port(port), None)
        .await
        .unwrap_err();

    assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::ConnectionRefused));
    assert_eq!(session.status(), SessionStatus::Disconnected);
    broker.await.unwrap();
}

#[tokio::test]
async fn test_reconnects_when_broker_drops_connection() {
    let (listener, port) = bind().await;
    let (reaccepted_tx, reaccepted_rx) = tokio::sync::oneshot::channel();

    let broker = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        read_packet(&mut first).await;
        first.write_all(&CONNACK_ACCEPTED).await.unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut second).await;
        assert_eq!(header, 0x10);
        second.write_all(&CONNACK_ACCEPTED).await.unwrap();
        let _ = reaccepted_tx.send(());

        // Hold the connection until the client says goodbye
        let (header, _) = read_packet(&mut second).await;
        assert_eq!(header, 0xE0);
    });

    let mut session = MqttSession::new(fast_settings());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("127.0.0.1").with_port(port), None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), reaccepted_rx)
        .await
        .unwrap()
        .unwrap();
    let restored = wait_for_status(&mut status, SessionStatus::Connected).await;
    assert_eq!(restored.retry_count, 0);
    assert!(session.is_connected());

    session.disconnect().await;
    tokio::time::timeout(Duration::from_secs(5), broker)
        .await
        .unwrap()
        .unwrap();
}
