//! Error taxonomy for the engine.
//!
//! Every fallible boundary in this crate returns one of these types (or
//! folds into [`MqttError`]), never a bare `String` or `&'static str`.

use crate::types::reason_code::ReasonCode;

/// Framing/codec errors: truncation, illegal variable-length integers,
/// property misuse, non-UTF8 text. Always fatal to the current
/// connection.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("connection closed before a full packet was read")]
    UnexpectedEof,
    #[error("variable byte integer used more than 4 bytes")]
    VarIntTooLong,
    #[error("remaining length exceeds the configured maximum incoming packet size")]
    PacketTooLarge,
    #[error("string or binary field is not valid UTF-8 or contains an embedded NUL")]
    MalformedString,
    #[error("unknown property identifier 0x{0:02x} for this packet type")]
    UnknownProperty(u8),
    #[error("singleton property 0x{0:02x} appeared more than once")]
    DuplicateProperty(u8),
    #[error("property 0x{0:02x} is not valid on this packet type")]
    DisallowedProperty(u8),
    #[error("unrecognized or reserved packet type/flags byte 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("packet body did not match its declared remaining length")]
    LengthMismatch,
    #[error("a packet-id-bearing packet type was decoded without a nonzero packet id")]
    MissingPacketId,
}

/// Protocol-level violations detected after framing succeeds: topic
/// alias misuse, unexpected packet types mid-handshake, receive-maximum
/// breaches under the strict inbound policy. Each carries the v5 reason
/// code the engine would send back to the server in a DISCONNECT.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("protocol error ({reason:?}): {detail}")]
pub struct ProtocolError {
    pub reason: ReasonCode,
    pub detail: &'static str,
}

impl ProtocolError {
    pub fn new(reason: ReasonCode, detail: &'static str) -> Self {
        Self { reason, detail }
    }
}

/// CONNACK refused the connection, v3 or v5.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("v3 CONNACK refused the connection: {0:?}")]
    V3Refused(V3ConnectError),
    #[error("v5 CONNACK refused the connection: {reason:?} ({reason_string:?})")]
    V5Refused {
        reason: ReasonCode,
        reason_string: Option<String>,
    },
    #[error("an unexpected packet type arrived during the CONNECT/CONNACK handshake")]
    UnexpectedPacket,
    #[error("the handshake did not complete before the connect timeout elapsed")]
    TimedOut,
    #[error("enhanced authentication method mismatch on AUTH exchange")]
    AuthMethodMismatch,
}

/// The six v3.1.1 CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V3ConnectError {
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    GenericRefused,
}

impl V3ConnectError {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            0 => return None,
            _ => Self::GenericRefused,
        })
    }
}

/// A v5 reason code of >= 0x80 on an ack packet (PUBACK/PUBREC/PUBCOMP/
/// SUBACK/UNSUBACK), propagated to the completion handle for that
/// specific operation.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("operation refused by server: {reason:?}{}", reason_string.as_deref().map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct OperationError {
    pub reason: ReasonCode,
    pub reason_string: Option<String>,
}

/// Bad topic/payload/subscription, or a packet that would violate an
/// advertised server capability. Caught before the packet ever reaches
/// the codec; the completion handle fails immediately.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("topic name is empty")]
    EmptyTopic,
    #[error("topic name exceeds the configured maximum length")]
    TopicTooLong,
    #[error("topic name contains a wildcard character, embedded NUL, or is not valid UTF-8")]
    InvalidTopic,
    #[error("topic filter is malformed: {0}")]
    InvalidFilter(&'static str),
    #[error("payload is marked as UTF-8 but is not valid UTF-8")]
    InvalidUtf8Payload,
    #[error("encoded packet size {size} exceeds the server's maximum packet size {max}")]
    PacketTooLarge { size: usize, max: u32 },
    #[error("QoS {requested} exceeds the server's maximum QoS {max}")]
    QosNotSupported { requested: u8, max: u8 },
    #[error("retain is set but the server does not support retained messages")]
    RetainNotSupported,
    #[error("no-local is set on a shared subscription filter, which MQTT forbids")]
    NoLocalOnSharedSubscription,
    #[error("client identifier is empty and clean_session=false without a v5 session-expiry-interval")]
    EmptyClientIdRequiresCleanSession,
}

/// Metadata carried by a server-initiated (or locally initiated) v5
/// DISCONNECT. Modeled like [`MqttError`] with the extra optional
/// fields a v5 DISCONNECT's reason string and server reference carry.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Default)]
#[error("disconnected: {reason:?}{}", reason_string.as_deref().map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct DisconnectError {
    pub reason: ReasonCode,
    pub reason_string: Option<String>,
    pub session_expiry_interval: Option<u32>,
    pub server_reference: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

/// A sentinel failure handed to completion handles that are still
/// pending when the client shuts down.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("client disconnected")]
pub struct ClientDisconnected;

/// The union of every error this crate can surface.
#[derive(Debug, thiserror::Error, Clone)]
pub enum MqttError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Disconnect(#[from] DisconnectError),
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    TimedOut,
}

impl From<ClientDisconnected> for MqttError {
    fn from(_: ClientDisconnected) -> Self {
        Self::ClientDisconnected
    }
}
