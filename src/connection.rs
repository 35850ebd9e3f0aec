//! Connection lifecycle: the CONNECT/CONNACK handshake, the keepalive
//! timer, the per-connection read/dispatch loop, and the outer
//! reconnect loop with exponential backoff.
//!
//! Unsolicited inbound traffic (PUBLISH, PINGRESP, server DISCONNECT)
//! has to be handled concurrently with outbound requests, so the
//! per-connection concurrency here is a reader task feeding decoded
//! packets over an mpsc channel to one logic task that `tokio::select!`s
//! over every source of work.
//!
//! `embedded_io_async`'s `Transport` bundles `Read` and `Write` on one
//! object rather than offering split owned halves the way tokio sockets
//! do, so [`split`] below builds that split itself: two thin handles
//! sharing the transport through a `tokio::sync::Mutex`. The reader task
//! owns the read half exclusively, which is what makes its `read_packet`
//! future safe to re-poll across iterations — nothing else ever
//! contends with it for that lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embedded_io_async::{ErrorType, Read, Write};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::callbacks::{ConnectionObserver, PublishHandler};
use crate::codec::ack::Ack;
use crate::codec::connect::{ConnAck, Connect};
use crate::codec::control::{Auth, Disconnect};
use crate::codec::property::Properties;
use crate::codec::{encode_packet, read_packet, Packet};
use crate::config::{ClientConfig, ServerCapabilities};
use crate::delivery::{Action, Engine, PublishRequest, SubscribeOutcome, SubscribeRequest};
use crate::error::{CodecError, DisconnectError, HandshakeError, MqttError, ProtocolError, V3ConnectError};
use crate::token::Token;
use crate::transport::{BrokerUrl, Dialer, Transport};
use crate::types::{PacketId, ProtocolVersion, ReasonCode};

/// The retransmit scan runs on this coarse tick.
const RETRANSMIT_TICK: Duration = Duration::from_secs(5);
/// An entry is due for retransmission once it has sat unacknowledged
/// for this long.
const RETRANSMIT_IDLE: Duration = Duration::from_secs(10);

/// A request from a [`crate::client::MqttClient`] handle to the task
/// that owns the live connection.
pub(crate) enum Command {
    Publish {
        request: PublishRequest,
        respond: oneshot::Sender<Result<Token<()>, MqttError>>,
    },
    Subscribe {
        requests: Vec<SubscribeRequest>,
        respond: oneshot::Sender<Token<Vec<SubscribeOutcome>>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        respond: oneshot::Sender<Token<()>>,
    },
    Disconnect {
        respond: oneshot::Sender<()>,
    },
    /// Client-initiated re-authentication: sends
    /// AUTH with reason `ReAuthenticate`. The resolved `respond` signals
    /// only that the packet left the writer; the exchange itself plays
    /// out through ordinary inbound AUTH handling alongside normal
    /// packet flow.
    Reauthenticate {
        respond: oneshot::Sender<Result<(), MqttError>>,
    },
    Shutdown,
}

/// Half of a split [`Transport`], reading exclusively.
struct ReadHalf<T>(Arc<AsyncMutex<T>>);

/// Half of a split [`Transport`], writing exclusively.
struct WriteHalf<T>(Arc<AsyncMutex<T>>);

impl<T: ErrorType> ErrorType for ReadHalf<T> {
    type Error = T::Error;
}

impl<T: Read + Send> Read for ReadHalf<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.lock().await.read(buf).await
    }
}

impl<T: ErrorType> ErrorType for WriteHalf<T> {
    type Error = T::Error;
}

impl<T: Write + Send> Write for WriteHalf<T> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.lock().await.write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.lock().await.flush().await
    }
}

fn split<T: Transport>(transport: T) -> (ReadHalf<T>, WriteHalf<T>) {
    let shared = Arc::new(AsyncMutex::new(transport));
    (ReadHalf(shared.clone()), WriteHalf(shared))
}

/// One event the reader task hands back to the logic task: a decoded
/// packet, or the framing error that ended the reader loop.
enum ReaderEvent {
    Packet(Packet),
    Error(CodecError),
}

async fn run_reader<T: Read + Send + 'static>(
    mut read_half: ReadHalf<T>,
    protocol_version: ProtocolVersion,
    max_incoming_packet: u32,
    events: mpsc::Sender<ReaderEvent>,
) {
    loop {
        match read_packet(&mut read_half, protocol_version, max_incoming_packet).await {
            Ok(packet) => {
                log::trace!("reader: decoded a {} packet", packet.type_name());
                if events.send(ReaderEvent::Packet(packet)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("reader: fatal framing error, ending connection: {e}");
                let _ = events.send(ReaderEvent::Error(e)).await;
                return;
            }
        }
    }
}

/// Drains the outbound frame queue to the transport, coalescing
/// whatever is already buffered into one flush, and separately owns
/// keepalive timing: it tracks its own last-write time, watches
/// `last_recv` for the last actual inbound bytes (only the reader
/// updates that, never a local write), and sends an unsolicited PINGREQ
/// once the connection has been quiet in both directions for 3/4 of a
/// keep-alive interval. A PINGREQ outstanding longer than 1.5x the
/// interval without any inbound bytes is reported back over `dead_tx`
/// and ends this task; the logic loop turns that into the connection's
/// `KeepAliveTimeout` error.
async fn run_writer<T: Write + Send + 'static>(
    mut write_half: WriteHalf<T>,
    protocol_version: ProtocolVersion,
    keep_alive: u16,
    mut last_recv: watch::Receiver<Instant>,
    ping_outstanding: Arc<AtomicBool>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    dead_tx: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(if keep_alive == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs((keep_alive as u64 / 4).max(1))
    });
    let mut last_send = Instant::now();
    let mut dead_tx = Some(dead_tx);

    loop {
        tokio::select! {
            maybe_frame = frames.recv() => {
                let Some(mut buf) = maybe_frame else {
                    log::trace!("writer: outbound queue closed, ending writer task");
                    return;
                };
                // Coalesce whatever else is already queued into this flush.
                while let Ok(more) = frames.try_recv() {
                    buf.extend_from_slice(&more);
                }
                log::trace!("writer: flushing {} bytes", buf.len());
                if write_half.write_all(&buf).await.is_err() || write_half.flush().await.is_err() {
                    log::error!("writer: transport write failed, ending writer task");
                    return;
                }
                last_send = Instant::now();
            }

            _ = ticker.tick(), if keep_alive != 0 => {
                let since_recv = last_recv.borrow().elapsed().as_secs_f64();
                let threshold = keep_alive as f64 * 1.5;
                if since_recv > threshold {
                    log::error!("writer: no inbound bytes for {since_recv:.1}s (keep_alive={keep_alive}s), declaring the connection dead");
                    if let Some(tx) = dead_tx.take() {
                        let _ = tx.send(());
                    }
                    return;
                }
                let quiet_for = last_send.elapsed().as_secs_f64().max(last_recv.borrow().elapsed().as_secs_f64());
                if quiet_for >= keep_alive as f64 * 0.75 && !ping_outstanding.load(Ordering::Relaxed) {
                    let bytes = encode_packet(&Packet::PingReq, protocol_version);
                    if write_half.write_all(&bytes).await.is_err() || write_half.flush().await.is_err() {
                        log::error!("writer: transport write failed sending PINGREQ, ending writer task");
                        return;
                    }
                    last_send = Instant::now();
                    ping_outstanding.store(true, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Drives one connection attempt to completion (either a clean shutdown
/// or an error that should trigger the reconnect loop).
struct ConnectionActor<D: Dialer> {
    dialer: Arc<D>,
    url: BrokerUrl,
    config: ClientConfig,
    handler: Option<Arc<dyn PublishHandler>>,
    observer: Arc<dyn ConnectionObserver>,
}

/// Builds the application-facing error for a received or locally
/// detected DISCONNECT.
fn disconnect_error(reason: ReasonCode, properties: &Properties) -> DisconnectError {
    DisconnectError {
        reason,
        reason_string: properties.reason_string.clone(),
        session_expiry_interval: properties.session_expiry_interval,
        server_reference: properties.server_reference.clone(),
        user_properties: properties.user_properties.clone(),
    }
}

impl<D: Dialer + 'static> ConnectionActor<D>
where
    D::Transport: 'static,
{
    /// Builds and sends CONNECT, then loops on AUTH packets (v5 enhanced authentication)
    /// until CONNACK arrives or the handshake fails. Runs on the
    /// unsplit transport since nothing needs to read and write
    /// concurrently here.
    async fn handshake(&self, transport: &mut D::Transport, client_id: &str) -> Result<(ConnAck, ServerCapabilities), HandshakeError> {
        let mut properties = Properties::default();
        if self.config.protocol_version.is_v5() {
            properties.receive_maximum = Some(self.config.receive_maximum);
            properties.topic_alias_maximum = Some(self.config.topic_alias_maximum);
            properties.session_expiry_interval = Some(self.config.session_expiry_interval.as_u32());
            if let Some(max) = self.config.max_packet_size {
                properties.maximum_packet_size = Some(max);
            }
            if let Some(auth) = &self.config.authenticator {
                properties.authentication_method = Some(auth.method().to_string());
                let data = auth.initial_data().await.map_err(|_| HandshakeError::AuthMethodMismatch)?;
                if !data.is_empty() {
                    properties.authentication_data = Some(data);
                }
            }
        }

        let connect = Connect {
            protocol_version: self.config.protocol_version,
            clean_start: self.config.clean_start,
            keep_alive: self.config.keep_alive.as_u16(),
            client_id: client_id.to_string(),
            will: self.config.will.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            properties,
        };

        write_packet(transport, &Packet::Connect(connect), self.config.protocol_version)
            .await
            .map_err(|_| HandshakeError::UnexpectedPacket)?;

        loop {
            let packet = tokio::time::timeout(
                self.config.connect_timeout,
                read_packet(transport, self.config.protocol_version, self.config.max_incoming_packet),
            )
            .await
            .map_err(|_| HandshakeError::TimedOut)?
            .map_err(|_| HandshakeError::UnexpectedPacket)?;

            match packet {
                Packet::ConnAck(ack) => {
                    if !ack.reason_code.is_success() {
                        if self.config.protocol_version.is_v5() {
                            return Err(HandshakeError::V5Refused {
                                reason: ack.reason_code,
                                reason_string: ack.properties.reason_string.clone(),
                            });
                        }
                        let code = V3ConnectError::from_code(ack.reason_code.as_u8()).unwrap_or(V3ConnectError::GenericRefused);
                        return Err(HandshakeError::V3Refused(code));
                    }
                    let caps = capabilities_from_connack(&ack, self.config.protocol_version);
                    if let Some(auth) = &self.config.authenticator {
                        let _ = auth.complete().await;
                    }
                    return Ok((ack, caps));
                }
                Packet::Auth(Auth { reason_code, properties }) if reason_code == ReasonCode::ContinueAuthentication => {
                    let auth = self.config.authenticator.as_ref().ok_or(HandshakeError::AuthMethodMismatch)?;
                    let server_data = properties.authentication_data.unwrap_or_default();
                    let response = auth.challenge(&server_data).await.map_err(|_| HandshakeError::AuthMethodMismatch)?;
                    let reply = Auth {
                        reason_code: ReasonCode::ContinueAuthentication,
                        properties: Properties {
                            authentication_method: Some(auth.method().to_string()),
                            authentication_data: Some(response),
                            ..Properties::default()
                        },
                    };
                    write_packet(transport, &Packet::Auth(reply), self.config.protocol_version)
                        .await
                        .map_err(|_| HandshakeError::UnexpectedPacket)?;
                }
                _ => return Err(HandshakeError::UnexpectedPacket),
            }
        }
    }

    /// Runs one connection attempt end to end: dial, handshake, spawn the
    /// reader task, then drive the logic loop until disconnection.
    async fn run_once(
        &self,
        engine: &mut Engine,
        commands: &mut mpsc::Receiver<Command>,
        clean_start: bool,
        client_id: &mut String,
        delay: &mut Duration,
        initial_delay: Duration,
    ) -> Result<(), MqttError> {
        let mut transport = self
            .dialer
            .dial(self.url.network.as_str(), &format!("{}:{}", self.url.host, self.url.port))
            .await?;

        let (_ack, capabilities) = self.handshake(&mut transport, client_id).await?;
        // Reached once the broker has accepted this connection, so a
        // later drop (however soon) pays only the base delay on its next
        // attempt rather than whatever backoff the prior failures built up.
        *delay = initial_delay;
        // A v5 server-assigned client identifier replaces the configured
        // one for every later reconnect attempt; this does NOT apply to
        // server-keep-alive or session-expiry, which the reconnect loop
        // always re-requests at their originally configured values (see
        // `run_reconnect_loop`).
        if let Some(assigned) = &capabilities.assigned_client_identifier {
            *client_id = assigned.clone();
        }
        let session_present = capabilities.session_present;
        let effective_keep_alive = capabilities.server_keep_alive.unwrap_or_else(|| self.config.keep_alive.as_u16());
        engine.capabilities = capabilities.clone();
        engine.outbound_window.set_max(if capabilities.receive_maximum == 0 {
            u16::MAX
        } else {
            capabilities.receive_maximum
        });

        let (read_half, write_half) = split(transport);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(self.config.outbound_queue_capacity);
        let (last_recv_tx, last_recv_rx) = watch::channel(Instant::now());
        let ping_outstanding = Arc::new(AtomicBool::new(false));
        let (dead_tx, dead_rx) = oneshot::channel();
        let writer_handle = tokio::spawn(run_writer(
            write_half,
            self.config.protocol_version,
            effective_keep_alive,
            last_recv_rx,
            ping_outstanding.clone(),
            outbound_rx,
            dead_tx,
        ));

        let outbound_alias_max = if self.config.protocol_version.is_v5() {
            capabilities.topic_alias_maximum
        } else {
            0
        };
        for action in engine.on_reconnect(outbound_alias_max, self.config.topic_alias_maximum, session_present && !clean_start) {
            self.apply_action(&outbound_tx, engine, action).await?;
        }
        self.observer.on_connect(session_present).await;

        // A fresh transport connection has acknowledged nothing yet, so
        // every still-pending QoS1 PUBLISH (DUP-flagged) and QoS2 PUBREL
        // is redelivered regardless of `session_present` — the broker
        // resuming the old session is precisely the case this exists for;
        // on the very first connection this is a no-op since nothing is
        // pending yet.
        for id in engine.pending_ids() {
            if let Some(action) = engine.retransmit_entry(id) {
                self.apply_action(&outbound_tx, engine, action).await?;
            }
        }

        let (events_tx, mut events_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let reader_handle = tokio::spawn(run_reader(
            read_half,
            self.config.protocol_version,
            self.config.max_incoming_packet,
            events_tx,
        ));

        let result = self
            .drive(&outbound_tx, engine, commands, &mut events_rx, &last_recv_tx, &ping_outstanding, dead_rx)
            .await;
        reader_handle.abort();
        // Dropping the sender lets the writer drain whatever is still
        // queued (including a just-sent graceful DISCONNECT) and exit on
        // its own; give it a brief grace period rather than aborting it
        // outright, so a clean disconnect's last bytes actually reach the
        // wire.
        drop(outbound_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), writer_handle).await;
        result
    }

    /// The per-connection logic loop: `tokio::select!` over inbound
    /// packets from the reader task, client commands, and the keepalive
    /// ticker.
    async fn drive(
        &self,
        outbound_tx: &mpsc::Sender<Vec<u8>>,
        engine: &mut Engine,
        commands: &mut mpsc::Receiver<Command>,
        events: &mut mpsc::Receiver<ReaderEvent>,
        last_recv_tx: &watch::Sender<Instant>,
        ping_outstanding: &Arc<AtomicBool>,
        mut dead_rx: oneshot::Receiver<()>,
    ) -> Result<(), MqttError> {
        let mut retransmit_ticker = tokio::time::interval(RETRANSMIT_TICK);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ReaderEvent::Packet(packet)) => {
                            let _ = last_recv_tx.send(Instant::now());
                            ping_outstanding.store(false, Ordering::Relaxed);
                            if self.handle_inbound(outbound_tx, engine, packet).await? {
                                return Ok(());
                            }
                        }
                        Some(ReaderEvent::Error(e)) => return Err(MqttError::Codec(e)),
                        None => return Err(MqttError::Transport("reader task ended unexpectedly".into())),
                    }
                }

                Some(cmd) = commands.recv() => {
                    if self.handle_command(outbound_tx, engine, cmd).await? {
                        return Ok(());
                    }
                }

                _ = &mut dead_rx => {
                    return Err(MqttError::Disconnect(DisconnectError {
                        reason: ReasonCode::KeepAliveTimeout,
                        ..Default::default()
                    }));
                }

                _ = retransmit_ticker.tick() => {
                    // Re-queues any pending client publish idle for
                    // RETRANSMIT_IDLE or more with DUP set. A full
                    // outbound queue aborts this round in place, leaving
                    // the remaining entries due — they are retried on the
                    // next tick rather than blocking the logic loop.
                    for id in engine.due_for_retransmit(RETRANSMIT_IDLE) {
                        if let Some(action) = engine.retransmit_entry(id) {
                            if !self.try_apply_retransmit(outbound_tx, action) {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking send for the retransmit tick, per spec.md's outbound
    /// queue deadlock avoidance: a full channel aborts this round rather
    /// than stalling the logic loop's responsiveness to new commands.
    /// `retransmit_entry` only ever returns `SendPublish`/`SendPubrel`, so
    /// no engine bookkeeping beyond the encode+enqueue is needed here.
    fn try_apply_retransmit(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, action: Action) -> bool {
        let packet = match action {
            Action::SendPublish(p) => Packet::Publish(p),
            Action::SendPubrel(id) => Packet::PubRel(ack_packet(id, ReasonCode::Success)),
            _ => {
                debug_assert!(false, "retransmit_entry returned an action other than SendPublish/SendPubrel");
                return true;
            }
        };
        let bytes = encode_packet(&packet, self.config.protocol_version);
        outbound_tx.try_send(bytes).is_ok()
    }

    /// Returns `Ok(true)` when the connection should end without error
    /// (a graceful server-initiated disconnect already handled).
    async fn handle_inbound(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, engine: &mut Engine, packet: Packet) -> Result<bool, MqttError> {
        match packet {
            Packet::Publish(publish) => {
                log::debug!("dispatching inbound PUBLISH (packet_id={:?})", publish.packet_id);
                for action in engine.handle_inbound_publish(publish) {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Packet::PubAck(Ack { packet_id, reason_code, properties }) => {
                log::debug!("dispatching inbound PUBACK for packet_id={packet_id}");
                for action in engine.handle_puback(packet_id, reason_code, properties.reason_string) {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Packet::PubRec(Ack { packet_id, reason_code, properties }) => {
                log::debug!("dispatching inbound PUBREC for packet_id={packet_id}");
                for action in engine.handle_pubrec(packet_id, reason_code, properties.reason_string) {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Packet::PubRel(Ack { packet_id, .. }) => {
                log::debug!("dispatching inbound PUBREL for packet_id={packet_id}");
                for action in engine.handle_pubrel(packet_id) {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Packet::PubComp(Ack { packet_id, reason_code, properties }) => {
                log::debug!("dispatching inbound PUBCOMP for packet_id={packet_id}");
                for action in engine.handle_pubcomp(packet_id, reason_code, properties.reason_string) {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Packet::SubAck(ack) => {
                engine.handle_suback(ack);
                Ok(false)
            }
            Packet::UnsubAck(ack) => {
                engine.handle_unsuback(ack);
                Ok(false)
            }
            Packet::PingResp => Ok(false),
            Packet::Disconnect(Disconnect { reason_code, properties }) => {
                let err = MqttError::Disconnect(disconnect_error(reason_code, &properties));
                self.observer.on_connection_lost(&err).await;
                if let Some(reference) = &properties.server_reference {
                    self.observer.on_server_redirect(reference).await;
                }
                if reason_code.is_success() {
                    Ok(true)
                } else {
                    Err(err)
                }
            }
            Packet::Auth(auth) => self.handle_steady_state_auth(outbound_tx, auth).await,
            other => {
                let err = ProtocolError::new(
                    ReasonCode::ProtocolError,
                    match other {
                        Packet::Connect(_) | Packet::ConnAck(_) => "unexpected CONNECT/CONNACK after handshake",
                        Packet::Subscribe(_) | Packet::Unsubscribe(_) => "server sent a client-to-server-only packet type",
                        _ => "unexpected packet type",
                    },
                );
                self.send_disconnect(outbound_tx, &err).await;
                Err(MqttError::Protocol(err))
            }
        }
    }

    /// Handles an AUTH packet arriving outside the CONNECT/CONNACK
    /// handshake: a client-initiated re-authentication challenge
    /// (`ContinueAuthentication`) or its conclusion (`Success`). Normal
    /// packet flow continues around this exchange; a method mismatch or
    /// an AUTH with no configured authenticator is a protocol error.
    async fn handle_steady_state_auth(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, auth: Auth) -> Result<bool, MqttError> {
        let Some(authenticator) = self.config.authenticator.as_ref() else {
            let err = ProtocolError::new(ReasonCode::ProtocolError, "AUTH received with no authenticator configured");
            self.send_disconnect(outbound_tx, &err).await;
            return Err(MqttError::Protocol(err));
        };

        if let Some(method) = &auth.properties.authentication_method {
            if method != authenticator.method() {
                let err = ProtocolError::new(ReasonCode::ProtocolError, "AUTH authentication-method mismatch");
                self.send_disconnect(outbound_tx, &err).await;
                return Err(MqttError::Protocol(err));
            }
        }

        match auth.reason_code {
            ReasonCode::ContinueAuthentication => {
                let server_data = auth.properties.authentication_data.unwrap_or_default();
                let response = match authenticator.challenge(&server_data).await {
                    Ok(response) => response,
                    Err(_) => {
                        let err = ProtocolError::new(ReasonCode::ProtocolError, "authenticator rejected an AUTH challenge");
                        self.send_disconnect(outbound_tx, &err).await;
                        return Err(MqttError::Protocol(err));
                    }
                };
                let reply = Auth {
                    reason_code: ReasonCode::ContinueAuthentication,
                    properties: Properties {
                        authentication_method: Some(authenticator.method().to_string()),
                        authentication_data: Some(response),
                        ..Properties::default()
                    },
                };
                self.send_frame(outbound_tx, &Packet::Auth(reply)).await?;
                Ok(false)
            }
            ReasonCode::Success => {
                let _ = authenticator.complete().await;
                Ok(false)
            }
            _ => {
                let err = ProtocolError::new(ReasonCode::ProtocolError, "unexpected AUTH reason code");
                self.send_disconnect(outbound_tx, &err).await;
                Err(MqttError::Protocol(err))
            }
        }
    }

    /// Returns `Ok(true)` once a local DISCONNECT or shutdown has been
    /// sent and the connection loop should end.
    async fn handle_command(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, engine: &mut Engine, cmd: Command) -> Result<bool, MqttError> {
        match cmd {
            Command::Publish { request, respond } => match engine.publish(request) {
                Ok((token, actions)) => {
                    let _ = respond.send(Ok(token));
                    for action in actions {
                        self.apply_action(outbound_tx, engine, action).await?;
                    }
                    Ok(false)
                }
                Err(e) => {
                    let _ = respond.send(Err(e));
                    Ok(false)
                }
            },
            Command::Subscribe { requests, respond } => {
                let (token, packet, actions) = engine.subscribe(requests);
                let _ = respond.send(token);
                self.send_frame(outbound_tx, &Packet::Subscribe(packet)).await?;
                for action in actions {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Command::Unsubscribe { filters, respond } => {
                let (token, packet, actions) = engine.unsubscribe(filters);
                let _ = respond.send(token);
                self.send_frame(outbound_tx, &Packet::Unsubscribe(packet)).await?;
                for action in actions {
                    self.apply_action(outbound_tx, engine, action).await?;
                }
                Ok(false)
            }
            Command::Disconnect { respond } => {
                let disconnect = Disconnect {
                    reason_code: ReasonCode::Success,
                    properties: Properties::default(),
                };
                let _ = self.send_frame(outbound_tx, &Packet::Disconnect(disconnect)).await;
                let _ = respond.send(());
                Ok(true)
            }
            Command::Reauthenticate { respond } => {
                let Some(auth) = &self.config.authenticator else {
                    let _ = respond.send(Err(MqttError::Protocol(ProtocolError::new(
                        ReasonCode::ProtocolError,
                        "reauthenticate() called with no authenticator configured",
                    ))));
                    return Ok(false);
                };
                let result = async {
                    let data = auth.initial_data().await?;
                    let reauth = Auth {
                        reason_code: ReasonCode::ReAuthenticate,
                        properties: Properties {
                            authentication_method: Some(auth.method().to_string()),
                            authentication_data: (!data.is_empty()).then_some(data),
                            ..Properties::default()
                        },
                    };
                    self.send_frame(outbound_tx, &Packet::Auth(reauth)).await
                }
                .await;
                let _ = respond.send(result);
                Ok(false)
            }
            Command::Shutdown => {
                let disconnect = Disconnect {
                    reason_code: ReasonCode::Success,
                    properties: Properties::default(),
                };
                let _ = self.send_frame(outbound_tx, &Packet::Disconnect(disconnect)).await;
                Ok(true)
            }
        }
    }

    /// Encodes and enqueues `packet` onto the writer task's outbound
    /// queue, blocking (applying backpressure) if it is momentarily full.
    async fn send_frame(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, packet: &Packet) -> Result<(), MqttError> {
        let bytes = encode_packet(packet, self.config.protocol_version);
        outbound_tx
            .send(bytes)
            .await
            .map_err(|_| MqttError::Transport("writer task ended unexpectedly".into()))
    }

    /// Best-effort wire DISCONNECT carrying `err`'s reason code, sent
    /// before a protocol violation is surfaced as an error — spec.md
    /// section 7 requires this for every protocol error, not just the
    /// locally-initiated graceful case. Failure here is not itself
    /// reported: the connection is already ending either way.
    async fn send_disconnect(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, err: &ProtocolError) {
        let disconnect = Disconnect {
            reason_code: err.reason,
            properties: Properties {
                reason_string: Some(err.detail.to_string()),
                ..Properties::default()
            },
        };
        let _ = self.send_frame(outbound_tx, &Packet::Disconnect(disconnect)).await;
    }

    async fn apply_action(&self, outbound_tx: &mpsc::Sender<Vec<u8>>, engine: &mut Engine, action: Action) -> Result<(), MqttError> {
        match action {
            Action::SendPublish(p) => self.send_frame(outbound_tx, &Packet::Publish(p)).await,
            Action::SendSubscribe(p) => self.send_frame(outbound_tx, &Packet::Subscribe(p)).await,
            Action::SendUnsubscribe(p) => self.send_frame(outbound_tx, &Packet::Unsubscribe(p)).await,
            Action::SendPuback(id, reason) => {
                self.send_frame(outbound_tx, &Packet::PubAck(ack_packet(id, reason))).await?;
                engine.on_inbound_ack_sent();
                Ok(())
            }
            Action::SendPubrec(id, reason) => self.send_frame(outbound_tx, &Packet::PubRec(ack_packet(id, reason))).await,
            Action::SendPubrel(id) => self.send_frame(outbound_tx, &Packet::PubRel(ack_packet(id, ReasonCode::Success))).await,
            Action::SendPubcomp(id) => {
                let result = self.send_frame(outbound_tx, &Packet::PubComp(ack_packet(id, ReasonCode::Success))).await;
                engine.on_inbound_ack_sent();
                result
            }
            Action::Deliver {
                message,
                matched_filters,
                matched_handlers,
            } => {
                if matched_filters.is_empty() {
                    log::debug!("inbound publish on '{}' matched no local subscription", message.topic);
                }
                // Every matched filter that carried its own handler gets
                // it; filters with none (and a wholly unmatched publish)
                // fall back to the client's default handler.
                let handlers: Vec<_> = if matched_handlers.is_empty() {
                    self.handler.clone().into_iter().collect()
                } else {
                    matched_handlers
                };
                for handler in handlers {
                    let message = message.clone();
                    tokio::spawn(async move { handler.handle(message).await });
                }
                Ok(())
            }
            Action::FatalProtocolError(err) => {
                self.send_disconnect(outbound_tx, &err).await;
                Err(MqttError::Protocol(err))
            }
        }
    }
}

fn ack_packet(id: PacketId, reason: ReasonCode) -> Ack {
    Ack {
        packet_id: id,
        reason_code: reason,
        properties: Properties::default(),
    }
}

async fn write_packet<W: Write>(transport: &mut W, packet: &Packet, version: ProtocolVersion) -> Result<(), MqttError> {
    let bytes = encode_packet(packet, version);
    transport.write_all(&bytes).await.map_err(|_| MqttError::Transport("write failed".into()))?;
    transport.flush().await.map_err(|_| MqttError::Transport("flush failed".into()))
}

fn capabilities_from_connack(ack: &ConnAck, version: ProtocolVersion) -> ServerCapabilities {
    if !version.is_v5() {
        let mut caps = ServerCapabilities::v3_default();
        caps.session_present = ack.session_present;
        return caps;
    }
    let p = &ack.properties;
    ServerCapabilities {
        session_present: ack.session_present,
        maximum_qos: p.maximum_qos,
        retain_available: p.retain_available.unwrap_or(true),
        wildcard_subscription_available: p.wildcard_subscription_available.unwrap_or(true),
        subscription_identifier_available: p.subscription_identifier_available.unwrap_or(true),
        shared_subscription_available: p.shared_subscription_available.unwrap_or(true),
        receive_maximum: p.receive_maximum.unwrap_or(u16::MAX),
        topic_alias_maximum: p.topic_alias_maximum.unwrap_or(0),
        maximum_packet_size: p.maximum_packet_size,
        assigned_client_identifier: p.assigned_client_identifier.clone(),
        server_keep_alive: p.server_keep_alive,
    }
}

/// Runs the reconnect loop until [`Command::Shutdown`] is received: dial,
/// handshake, run, and on any error back off exponentially before trying
/// again, per [`crate::config::ReconnectPolicy`], reset to the initial
/// delay on a successful handshake.
pub(crate) async fn run_reconnect_loop<D: Dialer + 'static>(
    dialer: Arc<D>,
    url: BrokerUrl,
    config: ClientConfig,
    handler: Option<Arc<dyn PublishHandler>>,
    observer: Arc<dyn ConnectionObserver>,
    mut commands: mpsc::Receiver<Command>,
) where
    D::Transport: 'static,
{
    let actor = ConnectionActor {
        dialer,
        url,
        config: config.clone(),
        handler,
        observer: observer.clone(),
    };

    let mut engine = Engine::new(
        config.protocol_version,
        config.max_topic_length,
        config.max_incoming_packet,
        config.receive_maximum,
        config.inbound_receive_max_policy,
        config.session_store.clone(),
    );

    if let Some(store) = &config.session_store {
        crate::delivery::hydrate_from_store(&mut engine, store.as_ref()).await;
    }

    let mut delay = config.reconnect.initial_delay;
    let mut first_attempt = true;
    // A v5 assigned-client-identifier persists across reconnects; every
    // other handshake field is re-requested at its originally configured
    // value on each attempt, so only this one piece of state survives a
    // connection attempt's end.
    let mut client_id = config.client_id.clone();

    loop {
        let clean_start = first_attempt && config.clean_start;
        match actor
            .run_once(&mut engine, &mut commands, clean_start, &mut client_id, &mut delay, config.reconnect.initial_delay)
            .await
        {
            Ok(()) => {
                engine.fail_all_pending();
                return;
            }
            Err(MqttError::ClientDisconnected) => {
                engine.fail_all_pending();
                return;
            }
            Err(err) => {
                log::warn!("connection attempt failed: {err}");
                observer.on_connection_lost(&err).await;
            }
        }

        first_attempt = false;
        log::info!("retrying the connection in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Shutdown) | None => {
                        engine.fail_all_pending();
                        return;
                    }
                    Some(other) => fail_command(other),
                }
            }
        }
        delay = Duration::from_secs_f64((delay.as_secs_f64() * config.reconnect.multiplier).min(config.reconnect.max_delay.as_secs_f64()));
    }
}

fn fail_command(cmd: Command) {
    match cmd {
        Command::Publish { respond, .. } => {
            let _ = respond.send(Err(MqttError::ClientDisconnected));
        }
        Command::Subscribe { respond, .. } => {
            let (source, tok) = crate::token::token();
            source.complete(Err(MqttError::ClientDisconnected));
            let _ = respond.send(tok);
        }
        Command::Unsubscribe { respond, .. } => {
            let (source, tok) = crate::token::token();
            source.complete(Err(MqttError::ClientDisconnected));
            let _ = respond.send(tok);
        }
        Command::Disconnect { respond } => {
            let _ = respond.send(());
        }
        Command::Reauthenticate { respond } => {
            let _ = respond.send(Err(MqttError::ClientDisconnected));
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_from_v3_connack_use_defaults() {
        let ack = ConnAck {
            session_present: true,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        let caps = capabilities_from_connack(&ack, ProtocolVersion::V4);
        assert!(caps.session_present);
        assert!(caps.retain_available);
        assert_eq!(caps.receive_maximum, u16::MAX);
    }

    #[test]
    fn capabilities_from_v5_connack_reflect_properties() {
        let ack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties {
                receive_maximum: Some(10),
                retain_available: Some(false),
                maximum_qos: Some(1),
                ..Properties::default()
            },
        };
        let caps = capabilities_from_connack(&ack, ProtocolVersion::V5);
        assert_eq!(caps.receive_maximum, 10);
        assert!(!caps.retain_available);
        assert_eq!(caps.maximum_qos, Some(1));
    }
}
