//! MQTT 3.1.1 protocol client over an owned byte stream
//!
//! Packets are encoded and decoded with `rumqttc`'s codec; this module adds the
//! client-side state machine around it: bounded send and receive buffers, packet id
//! allocation, acknowledgment tracking, QoS 1/2 handshakes for incoming messages and
//! keep-alive pings.
//!
//! Outbound calls only queue bytes. Everything leaves the process in [`sync`], which
//! reads whatever the socket has ready and writes whatever it accepts, never waiting on
//! the peer. Bytes the peer does not take stay queued; a peer that stops reading shows up
//! as `SendBufferFull` or `KeepAliveTimeout`.
//!
//! [`sync`]: ProtocolClient::sync

use super::message_handler::MessageHandler;
use super::protocol::{
    BufferSizes, ConnectOptions, ProtocolClient, ProtocolErrorCode, ProtocolFactory,
    ProtocolResult,
};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use rumqttc::mqttbytes::v4::{
    self, ConnectReturnCode, Connect, Disconnect, Login, Packet, PingReq, PubAck, PubComp,
    PubRec, PubRel, Publish, Subscribe, SubscribeReasonCode, Unsubscribe,
};
use rumqttc::mqttbytes::{Error as CodecError, QoS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Bound on delivering DISCONNECT to a peer that may have stopped reading
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// [`ProtocolFactory`] producing [`PacketClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketClientFactory;

impl ProtocolFactory for PacketClientFactory {
    fn init(
        &self,
        stream: BoxedStream,
        buffers: BufferSizes,
        handler: Option<MessageHandler>,
    ) -> Box<dyn ProtocolClient> {
        Box::new(PacketClient::new(stream, buffers, handler))
    }
}

/// Acknowledgment a packet id is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    PubAck,
    PubRec,
    PubComp,
    SubAck,
    UnsubAck,
}

pub struct PacketClient {
    stream: BoxedStream,
    send_buf: BytesMut,
    send_capacity: usize,
    recv_buf: BytesMut,
    recv_capacity: usize,
    handler: Option<MessageHandler>,
    error: Option<ProtocolErrorCode>,
    connected: bool,
    next_pkid: u16,
    pending: HashMap<u16, AckKind>,
    keep_alive: Duration,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl PacketClient {
    pub fn new(stream: BoxedStream, buffers: BufferSizes, handler: Option<MessageHandler>) -> Self {
        Self {
            stream,
            send_buf: BytesMut::with_capacity(buffers.send),
            send_capacity: buffers.send,
            recv_buf: BytesMut::with_capacity(buffers.recv),
            recv_capacity: buffers.recv,
            handler,
            error: None,
            connected: false,
            next_pkid: 0,
            pending: HashMap::new(),
            keep_alive: Duration::ZERO,
            last_sent: Instant::now(),
            ping_sent_at: None,
        }
    }

    /// Number of packets still waiting for an acknowledgment
    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    fn fail(&mut self, code: ProtocolErrorCode) -> ProtocolResult {
        self.error = Some(code);
        Err(code)
    }

    fn ready(&self) -> ProtocolResult {
        if let Some(code) = self.error {
            return Err(code);
        }
        if !self.connected {
            return Err(ProtocolErrorCode::ConnectNotCalled);
        }
        Ok(())
    }

    fn queue(&mut self, packet: Packet) -> ProtocolResult {
        let mut encoded = BytesMut::new();
        // Nothing is queued on failure, the connection itself is still fine
        encode(&packet, &mut encoded)?;

        if self.send_buf.len() + encoded.len() > self.send_capacity {
            return self.fail(ProtocolErrorCode::SendBufferFull);
        }

        self.send_buf.extend_from_slice(&encoded);
        Ok(())
    }

    /// Write whatever the socket accepts right now; the rest stays queued
    fn write_ready(&mut self) -> ProtocolResult {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf).now_or_never() {
                None => {
                    trace!(queued = self.send_buf.len(), "Socket not writable");
                    break;
                }
                Some(Ok(0)) => return self.fail(ProtocolErrorCode::ConnectionClosed),
                Some(Ok(n)) => {
                    trace!(bytes = n, "Wrote to socket");
                    self.send_buf.advance(n);
                    self.last_sent = Instant::now();
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Socket write failed");
                    return self.fail(ProtocolErrorCode::SocketError);
                }
            }
        }

        if let Some(Err(e)) = self.stream.flush().now_or_never() {
            debug!(error = %e, "Socket flush failed");
            return self.fail(ProtocolErrorCode::SocketError);
        }
        Ok(())
    }

    /// Write the whole send buffer, waiting on the socket. Callers bound the wait.
    async fn flush_all(&mut self) -> ProtocolResult {
        if self.send_buf.is_empty() {
            return Ok(());
        }

        let mut written = self.stream.write_all(&self.send_buf).await;
        if written.is_ok() {
            written = self.stream.flush().await;
        }

        if let Err(e) = written {
            debug!(error = %e, "Socket write failed");
            return self.fail(ProtocolErrorCode::SocketError);
        }

        trace!(bytes = self.send_buf.len(), "Flushed send buffer");
        self.send_buf.clear();
        self.last_sent = Instant::now();
        Ok(())
    }

    fn allocate_pkid(&mut self) -> Result<u16, ProtocolErrorCode> {
        if self.pending.len() >= usize::from(u16::MAX) {
            self.fail(ProtocolErrorCode::SendBufferFull)?;
        }
        loop {
            self.next_pkid = self.next_pkid.wrapping_add(1);
            if self.next_pkid != 0 && !self.pending.contains_key(&self.next_pkid) {
                return Ok(self.next_pkid);
            }
        }
    }

    /// Queue `packet` and wait for `kind` on `pkid`; rolls back the wait on failure
    fn queue_tracked(&mut self, packet: Packet, pkid: u16, kind: AckKind) -> ProtocolResult {
        self.pending.insert(pkid, kind);
        let queued = self.queue(packet);
        if queued.is_err() {
            self.pending.remove(&pkid);
        }
        queued
    }

    fn expect_ack(&mut self, pkid: u16, kind: AckKind) -> ProtocolResult {
        match self.pending.get(&pkid) {
            Some(waiting) if *waiting == kind => {
                self.pending.remove(&pkid);
                Ok(())
            }
            _ => {
                warn!(pkid, ?kind, "Acknowledgment for unknown packet");
                self.fail(ProtocolErrorCode::AckOfUnknown)
            }
        }
    }

    /// Decode the next complete packet from the receive buffer, if there is one
    fn decode_next(&mut self) -> Result<Option<Packet>, ProtocolErrorCode> {
        let frame_len = match frame_length(&self.recv_buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(code) => {
                self.fail(code)?;
                return Ok(None);
            }
        };

        if frame_len > self.recv_capacity {
            self.fail(ProtocolErrorCode::RecvBufferTooSmall)?;
        }
        if self.recv_buf.len() < frame_len {
            return Ok(None);
        }

        match v4::read(&mut self.recv_buf, self.recv_capacity) {
            Ok(packet) => Ok(Some(packet)),
            Err(CodecError::InsufficientBytes(_)) => Ok(None),
            Err(e) => {
                debug!(error = ?e, "Failed to decode inbound packet");
                self.fail(ProtocolErrorCode::MalformedPacket)?;
                Ok(None)
            }
        }
    }

    /// Read whatever the socket has ready without waiting. Returns false at would-block.
    fn read_ready(&mut self) -> Result<bool, ProtocolErrorCode> {
        if self.recv_buf.capacity() == self.recv_buf.len() {
            self.recv_buf.reserve(self.recv_capacity);
        }
        match self.stream.read_buf(&mut self.recv_buf).now_or_never() {
            None => Ok(false),
            Some(Ok(0)) => {
                self.fail(ProtocolErrorCode::ConnectionClosed)?;
                Ok(false)
            }
            Some(Ok(n)) => {
                trace!(bytes = n, "Read from socket");
                Ok(true)
            }
            Some(Err(e)) => {
                debug!(error = %e, "Socket read failed");
                self.fail(ProtocolErrorCode::SocketError)?;
                Ok(false)
            }
        }
    }

    fn handle_incoming(&mut self, packet: Packet) -> ProtocolResult {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PubAck(ack) => self.expect_ack(ack.pkid, AckKind::PubAck),
            Packet::PubRec(rec) => {
                self.expect_ack(rec.pkid, AckKind::PubRec)?;
                self.queue_tracked(
                    Packet::PubRel(PubRel::new(rec.pkid)),
                    rec.pkid,
                    AckKind::PubComp,
                )
            }
            Packet::PubComp(comp) => self.expect_ack(comp.pkid, AckKind::PubComp),
            Packet::PubRel(rel) => self.queue(Packet::PubComp(PubComp::new(rel.pkid))),
            Packet::SubAck(ack) => {
                self.expect_ack(ack.pkid, AckKind::SubAck)?;
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return self.fail(ProtocolErrorCode::SubscribeFailed);
                }
                Ok(())
            }
            Packet::UnsubAck(ack) => self.expect_ack(ack.pkid, AckKind::UnsubAck),
            Packet::PingResp => {
                self.ping_sent_at = None;
                Ok(())
            }
            Packet::Disconnect => self.fail(ProtocolErrorCode::ConnectionClosed),
            Packet::ConnAck(_) => {
                warn!("Ignoring CONNACK on an established connection");
                Ok(())
            }
            other => {
                warn!(packet = ?other, "Unexpected packet from broker");
                self.fail(ProtocolErrorCode::MalformedPacket)
            }
        }
    }

    fn handle_publish(&mut self, publish: Publish) -> ProtocolResult {
        debug!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
        if let Some(handler) = &self.handler {
            handler(&publish.topic, &publish.payload);
        }

        match publish.qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => self.queue(Packet::PubAck(PubAck::new(publish.pkid))),
            QoS::ExactlyOnce => self.queue(Packet::PubRec(PubRec::new(publish.pkid))),
        }
    }

    fn service_keep_alive(&mut self) -> ProtocolResult {
        if self.keep_alive.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        match self.ping_sent_at {
            Some(sent) if now.duration_since(sent) >= self.keep_alive => {
                warn!("No PINGRESP within keep-alive interval");
                self.fail(ProtocolErrorCode::KeepAliveTimeout)
            }
            Some(_) => Ok(()),
            None if now.duration_since(self.last_sent) >= self.keep_alive => {
                trace!("Sending PINGREQ");
                self.queue(Packet::PingReq)?;
                self.ping_sent_at = Some(now);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProtocolClient for PacketClient {
    async fn connect(&mut self, options: &ConnectOptions, timeout: Duration) -> ProtocolResult {
        if let Some(code) = self.error {
            return Err(code);
        }

        let mut connect = Connect::new(options.client_id.clone().unwrap_or_default());
        connect.keep_alive = options.keep_alive_secs;
        connect.clean_session = options.clean_session;
        if let Some(username) = &options.username {
            connect.login = Some(Login::new(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            ));
        }
        self.keep_alive = Duration::from_secs(u64::from(options.keep_alive_secs));

        let deadline = Instant::now() + timeout;
        self.queue(Packet::Connect(connect))?;
        match tokio::time::timeout_at(deadline, self.flush_all()).await {
            Ok(written) => written?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out sending CONNECT");
                return self.fail(ProtocolErrorCode::SocketError);
            }
        }

        loop {
            if let Some(packet) = self.decode_next()? {
                return match packet {
                    Packet::ConnAck(ack) if matches!(ack.code, ConnectReturnCode::Success) => {
                        debug!(session_present = ack.session_present, "CONNACK received");
                        self.connected = true;
                        Ok(())
                    }
                    Packet::ConnAck(ack) => {
                        warn!(code = ?ack.code, "Broker refused connection");
                        self.fail(ProtocolErrorCode::ConnectionRefused)
                    }
                    other => {
                        warn!(packet = ?other, "Expected CONNACK");
                        self.fail(ProtocolErrorCode::MalformedPacket)
                    }
                };
            }

            if self.recv_buf.capacity() == self.recv_buf.len() {
                self.recv_buf.reserve(self.recv_capacity);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.recv_buf)).await
            {
                Ok(Ok(0)) => return self.fail(ProtocolErrorCode::ConnectionClosed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "Socket read failed during handshake");
                    return self.fail(ProtocolErrorCode::SocketError);
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for CONNACK");
                    return self.fail(ProtocolErrorCode::SocketError);
                }
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> ProtocolResult {
        self.ready()?;

        let mut publish = Publish::new(topic, qos, payload.to_vec());
        publish.retain = retain;
        match qos {
            QoS::AtMostOnce => self.queue(Packet::Publish(publish)),
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let pkid = self.allocate_pkid()?;
                publish.pkid = pkid;
                let kind = if qos == QoS::AtLeastOnce {
                    AckKind::PubAck
                } else {
                    AckKind::PubRec
                };
                self.queue_tracked(Packet::Publish(publish), pkid, kind)
            }
        }
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> ProtocolResult {
        self.ready()?;

        let pkid = self.allocate_pkid()?;
        let mut subscribe = Subscribe::new(topic, qos);
        subscribe.pkid = pkid;
        self.queue_tracked(Packet::Subscribe(subscribe), pkid, AckKind::SubAck)
    }

    fn unsubscribe(&mut self, topic: &str) -> ProtocolResult {
        self.ready()?;

        let pkid = self.allocate_pkid()?;
        let mut unsubscribe = Unsubscribe::new(topic);
        unsubscribe.pkid = pkid;
        self.queue_tracked(Packet::Unsubscribe(unsubscribe), pkid, AckKind::UnsubAck)
    }

    async fn disconnect(&mut self) -> ProtocolResult {
        self.ready()?;

        debug!(inflight = self.inflight(), "Sending DISCONNECT");
        self.queue(Packet::Disconnect)?;
        self.connected = false;
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.flush_all()).await {
            Ok(written) => written?,
            Err(_) => {
                warn!("Timed out sending DISCONNECT");
                return self.fail(ProtocolErrorCode::SocketError);
            }
        }
        // Best effort; the stream is dropped with the client anyway
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, self.stream.shutdown()).await;
        Ok(())
    }

    async fn sync(&mut self) -> ProtocolResult {
        self.ready()?;

        loop {
            while let Some(packet) = self.decode_next()? {
                trace!(packet = ?packet, "Packet received");
                self.handle_incoming(packet)?;
            }
            if !self.read_ready()? {
                break;
            }
        }

        self.service_keep_alive()?;
        self.write_ready()
    }

    fn error(&self) -> Option<ProtocolErrorCode> {
        self.error
    }
}

/// Serialize a client-bound packet with the codec's per-packet encoders
fn encode(packet: &Packet, buf: &mut BytesMut) -> ProtocolResult {
    let written = match packet {
        Packet::Connect(connect) => connect.write(buf),
        Packet::Publish(publish) => publish.write(buf),
        Packet::PubAck(ack) => ack.write(buf),
        Packet::PubRec(rec) => rec.write(buf),
        Packet::PubRel(rel) => rel.write(buf),
        Packet::PubComp(comp) => comp.write(buf),
        Packet::Subscribe(subscribe) => subscribe.write(buf),
        Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buf),
        Packet::PingReq => PingReq.write(buf),
        Packet::Disconnect => Disconnect.write(buf),
        other => {
            warn!(packet = ?other, "Refusing to encode a broker-side packet");
            return Err(ProtocolErrorCode::MalformedPacket);
        }
    };

    match written {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!(error = ?e, "Failed to encode outbound packet");
            Err(ProtocolErrorCode::MalformedPacket)
        }
    }
}

/// Total length of the frame at the start of `buf`, once its fixed header is complete
fn frame_length(buf: &[u8]) -> Result<Option<usize>, ProtocolErrorCode> {
    let mut remaining = 0usize;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(1 + (i + 1) + remaining));
        }
    }
    if buf.len() >= 5 {
        return Err(ProtocolErrorCode::MalformedPacket);
    }
    Ok(None)
}
