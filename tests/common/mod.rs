//! Fake-peer test harness: an in-memory duplex byte pipe standing in
//! for a TCP socket (spec.md section 1: transport is an opaque
//! bidirectional byte stream), driven directly by each test as "the
//! broker side" via the same codec this crate uses for the client
//! side. Mirrors the teacher's `tests/common` split
//! (`obabec-rust-mqtt/tests/common/mod.rs`), generalized from a real
//! `TcpStream` against a locally running broker to a duplex pipe with
//! no broker process at all, since this crate's scope stops at the
//! transport boundary.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use embedded_io_adapters::tokio_1::FromTokio;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use mqtt_engine::callbacks::{ConnectionObserver, PublishHandler};
use mqtt_engine::codec::connect::ConnAck;
use mqtt_engine::codec::property::Properties;
use mqtt_engine::codec::{encode_packet, read_packet, Packet};
use mqtt_engine::delivery::IncomingMessage;
use mqtt_engine::transport::Dialer;
use mqtt_engine::{MqttError, ProtocolVersion, ReasonCode};

pub type PeerHalf = FromTokio<DuplexStream>;

/// Reads the next packet off the peer-side half, as the broker would.
pub async fn peer_read(peer: &mut PeerHalf, version: ProtocolVersion) -> Packet {
    read_packet(peer, version, 1 << 20).await.expect("peer read a malformed packet")
}

/// Writes a packet out the peer-side half, as the broker would.
pub async fn peer_write(peer: &mut PeerHalf, packet: &Packet, version: ProtocolVersion) {
    use embedded_io_async::Write;
    let bytes = encode_packet(packet, version);
    peer.write_all(&bytes).await.expect("peer write failed");
    peer.flush().await.expect("peer flush failed");
}

/// Reads the client's CONNECT and answers with a plain-accept CONNACK,
/// the minimum handshake every test needs before exercising anything
/// else.
pub async fn accept_handshake(peer: &mut PeerHalf, version: ProtocolVersion, session_present: bool) {
    match peer_read(peer, version).await {
        Packet::Connect(_) => {}
        other => panic!("expected CONNECT, got {}", other.type_name()),
    }
    let connack = ConnAck {
        session_present,
        reason_code: ReasonCode::Success,
        properties: Properties::default(),
    };
    peer_write(peer, &Packet::ConnAck(connack), version).await;
}

/// A [`Dialer`] backed by a queue of pre-built duplex pairs. Each
/// `dial()` call hands out the next queued client-side half, so a test
/// exercising the reconnect loop can queue up a second connection ahead
/// of time and drive it as a second, independent fake peer.
pub struct QueuedDialer {
    queue: AsyncMutex<VecDeque<PeerHalf>>,
}

impl QueuedDialer {
    pub fn new() -> Self {
        Self { queue: AsyncMutex::new(VecDeque::new()) }
    }

    /// Builds one fresh duplex pair, queues the client-side half for the
    /// next `dial()`, and returns the peer-side half for the test to
    /// drive directly.
    pub async fn queue_connection(&self) -> PeerHalf {
        let (client_side, peer_side) = tokio::io::duplex(64 * 1024);
        self.queue.lock().await.push_back(FromTokio::new(client_side));
        FromTokio::new(peer_side)
    }
}

#[async_trait]
impl Dialer for QueuedDialer {
    type Transport = PeerHalf;

    async fn dial(&self, _network: &str, _address: &str) -> Result<Self::Transport, MqttError> {
        self.queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| MqttError::Transport("no queued fake-peer connection left".into()))
    }
}

/// Captures every inbound PUBLISH handed to the application, off the
/// logic loop, over an unbounded channel a test can drain.
pub struct CapturingHandler(pub mpsc::UnboundedSender<IncomingMessage>);

#[async_trait]
impl PublishHandler for CapturingHandler {
    async fn handle(&self, message: IncomingMessage) {
        let _ = self.0.send(message);
    }
}

pub fn capturing_handler() -> (Arc<CapturingHandler>, mpsc::UnboundedReceiver<IncomingMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(CapturingHandler(tx)), rx)
}

/// Waits briefly for an inbound message, bounded so a test fails fast
/// instead of hanging if delivery is ever broken.
pub async fn recv_message(rx: &mut mpsc::UnboundedReceiver<IncomingMessage>) -> IncomingMessage {
    tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a delivered message")
        .expect("handler channel closed unexpectedly")
}

/// A [`ConnectionObserver`] that reports every connection-lost event
/// over an unbounded channel a test can drain, for asserting on the
/// specific error (e.g. a keepalive timeout) that ended a connection.
pub struct CapturingObserver(pub mpsc::UnboundedSender<MqttError>);

#[async_trait]
impl ConnectionObserver for CapturingObserver {
    async fn on_connection_lost(&self, error: &MqttError) {
        let _ = self.0.send(error.clone());
    }
}

pub fn capturing_observer() -> (Arc<CapturingObserver>, mpsc::UnboundedReceiver<MqttError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(CapturingObserver(tx)), rx)
}
