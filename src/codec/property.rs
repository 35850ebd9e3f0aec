use embedded_io_async::Read;

use crate::codec::reader::PacketReader;
use crate::codec::writer::{binary_len, string_len, varint_len, PacketWriter};
use crate::error::CodecError;

/// MQTT 5 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::PayloadFormatIndicator,
            0x02 => Self::MessageExpiryInterval,
            0x03 => Self::ContentType,
            0x08 => Self::ResponseTopic,
            0x09 => Self::CorrelationData,
            0x0B => Self::SubscriptionIdentifier,
            0x11 => Self::SessionExpiryInterval,
            0x12 => Self::AssignedClientIdentifier,
            0x13 => Self::ServerKeepAlive,
            0x15 => Self::AuthenticationMethod,
            0x16 => Self::AuthenticationData,
            0x17 => Self::RequestProblemInformation,
            0x18 => Self::WillDelayInterval,
            0x19 => Self::RequestResponseInformation,
            0x1A => Self::ResponseInformation,
            0x1C => Self::ServerReference,
            0x1F => Self::ReasonString,
            0x21 => Self::ReceiveMaximum,
            0x22 => Self::TopicAliasMaximum,
            0x23 => Self::TopicAlias,
            0x24 => Self::MaximumQoS,
            0x25 => Self::RetainAvailable,
            0x26 => Self::UserProperty,
            0x27 => Self::MaximumPacketSize,
            0x28 => Self::WildcardSubscriptionAvailable,
            0x29 => Self::SubscriptionIdentifierAvailable,
            0x2A => Self::SharedSubscriptionAvailable,
            _ => return None,
        })
    }
}

/// The union of every v5 property, with presence tracked per-field
/// (`Option` for at-most-once properties, `Vec` for the two repeatable
/// ones: User Property and Subscription Identifier). Each packet module
/// decodes into this common bag and then asserts its own allow-list,
/// rather than fifteen near-identical per-packet property structs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifier: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub request_problem_information: Option<bool>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<bool>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifier_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
}

macro_rules! set_once {
    ($slot:expr, $value:expr, $id:expr) => {
        if $slot.is_some() {
            return Err(CodecError::DuplicateProperty($id as u8));
        }
        $slot = Some($value);
    };
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub async fn decode<R: Read>(reader: &mut PacketReader<'_, R>) -> Result<Self, CodecError> {
        let len = reader.read_varint().await? as usize;
        let start_remaining = reader.remaining();
        let mut props = Self::default();

        while start_remaining - reader.remaining() < len {
            let id_byte = reader.read_u8().await?;
            let id = PropertyId::from_byte(id_byte).ok_or(CodecError::UnknownProperty(id_byte))?;
            match id {
                PropertyId::PayloadFormatIndicator => {
                    let v = reader.read_bool().await?;
                    set_once!(props.payload_format_indicator, v, id);
                }
                PropertyId::MessageExpiryInterval => {
                    let v = reader.read_u32().await?;
                    set_once!(props.message_expiry_interval, v, id);
                }
                PropertyId::ContentType => {
                    let v = reader.read_string().await?;
                    set_once!(props.content_type, v, id);
                }
                PropertyId::ResponseTopic => {
                    let v = reader.read_string().await?;
                    set_once!(props.response_topic, v, id);
                }
                PropertyId::CorrelationData => {
                    let v = reader.read_binary().await?;
                    set_once!(props.correlation_data, v, id);
                }
                PropertyId::SubscriptionIdentifier => {
                    let v = reader.read_varint().await?;
                    props.subscription_identifier.push(v);
                }
                PropertyId::SessionExpiryInterval => {
                    let v = reader.read_u32().await?;
                    set_once!(props.session_expiry_interval, v, id);
                }
                PropertyId::AssignedClientIdentifier => {
                    let v = reader.read_string().await?;
                    set_once!(props.assigned_client_identifier, v, id);
                }
                PropertyId::ServerKeepAlive => {
                    let v = reader.read_u16().await?;
                    set_once!(props.server_keep_alive, v, id);
                }
                PropertyId::AuthenticationMethod => {
                    let v = reader.read_string().await?;
                    set_once!(props.authentication_method, v, id);
                }
                PropertyId::AuthenticationData => {
                    let v = reader.read_binary().await?;
                    set_once!(props.authentication_data, v, id);
                }
                PropertyId::RequestProblemInformation => {
                    let v = reader.read_bool().await?;
                    set_once!(props.request_problem_information, v, id);
                }
                PropertyId::WillDelayInterval => {
                    let v = reader.read_u32().await?;
                    set_once!(props.will_delay_interval, v, id);
                }
                PropertyId::RequestResponseInformation => {
                    let v = reader.read_bool().await?;
                    set_once!(props.request_response_information, v, id);
                }
                PropertyId::ResponseInformation => {
                    let v = reader.read_string().await?;
                    set_once!(props.response_information, v, id);
                }
                PropertyId::ServerReference => {
                    let v = reader.read_string().await?;
                    set_once!(props.server_reference, v, id);
                }
                PropertyId::ReasonString => {
                    let v = reader.read_string().await?;
                    set_once!(props.reason_string, v, id);
                }
                PropertyId::ReceiveMaximum => {
                    let v = reader.read_u16().await?;
                    set_once!(props.receive_maximum, v, id);
                }
                PropertyId::TopicAliasMaximum => {
                    let v = reader.read_u16().await?;
                    set_once!(props.topic_alias_maximum, v, id);
                }
                PropertyId::TopicAlias => {
                    let v = reader.read_u16().await?;
                    set_once!(props.topic_alias, v, id);
                }
                PropertyId::MaximumQoS => {
                    let v = reader.read_u8().await?;
                    set_once!(props.maximum_qos, v, id);
                }
                PropertyId::RetainAvailable => {
                    let v = reader.read_bool().await?;
                    set_once!(props.retain_available, v, id);
                }
                PropertyId::UserProperty => {
                    let k = reader.read_string().await?;
                    let v = reader.read_string().await?;
                    props.user_properties.push((k, v));
                }
                PropertyId::MaximumPacketSize => {
                    let v = reader.read_u32().await?;
                    set_once!(props.maximum_packet_size, v, id);
                }
                PropertyId::WildcardSubscriptionAvailable => {
                    let v = reader.read_bool().await?;
                    set_once!(props.wildcard_subscription_available, v, id);
                }
                PropertyId::SubscriptionIdentifierAvailable => {
                    let v = reader.read_bool().await?;
                    set_once!(props.subscription_identifier_available, v, id);
                }
                PropertyId::SharedSubscriptionAvailable => {
                    let v = reader.read_bool().await?;
                    set_once!(props.shared_subscription_available, v, id);
                }
            }
        }

        if start_remaining - reader.remaining() != len {
            return Err(CodecError::LengthMismatch);
        }

        Ok(props)
    }

    pub fn encoded_body_len(&self) -> u32 {
        let mut len = 0usize;
        macro_rules! add {
            ($opt:expr, $payload:expr) => {
                if $opt.is_some() {
                    len += 1 + $payload;
                }
            };
        }
        add!(self.payload_format_indicator, 1);
        add!(self.message_expiry_interval, 4);
        if let Some(v) = &self.content_type {
            len += 1 + string_len(v);
        }
        if let Some(v) = &self.response_topic {
            len += 1 + string_len(v);
        }
        if let Some(v) = &self.correlation_data {
            len += 1 + binary_len(v);
        }
        for id in &self.subscription_identifier {
            len += 1 + varint_len(*id);
        }
        add!(self.session_expiry_interval, 4);
        if let Some(v) = &self.assigned_client_identifier {
            len += 1 + string_len(v);
        }
        add!(self.server_keep_alive, 2);
        if let Some(v) = &self.authentication_method {
            len += 1 + string_len(v);
        }
        if let Some(v) = &self.authentication_data {
            len += 1 + binary_len(v);
        }
        add!(self.request_problem_information, 1);
        add!(self.will_delay_interval, 4);
        add!(self.request_response_information, 1);
        if let Some(v) = &self.response_information {
            len += 1 + string_len(v);
        }
        if let Some(v) = &self.server_reference {
            len += 1 + string_len(v);
        }
        if let Some(v) = &self.reason_string {
            len += 1 + string_len(v);
        }
        add!(self.receive_maximum, 2);
        add!(self.topic_alias_maximum, 2);
        add!(self.topic_alias, 2);
        add!(self.maximum_qos, 1);
        add!(self.retain_available, 1);
        for (k, v) in &self.user_properties {
            len += 1 + string_len(k) + string_len(v);
        }
        add!(self.maximum_packet_size, 4);
        add!(self.wildcard_subscription_available, 1);
        add!(self.subscription_identifier_available, 1);
        add!(self.shared_subscription_available, 1);
        len as u32
    }

    pub fn encode(&self, w: &mut PacketWriter) {
        w.write_varint(self.encoded_body_len());

        if let Some(v) = self.payload_format_indicator {
            w.write_u8(PropertyId::PayloadFormatIndicator as u8);
            w.write_bool(v);
        }
        if let Some(v) = self.message_expiry_interval {
            w.write_u8(PropertyId::MessageExpiryInterval as u8);
            w.write_u32(v);
        }
        if let Some(v) = &self.content_type {
            w.write_u8(PropertyId::ContentType as u8);
            w.write_string(v);
        }
        if let Some(v) = &self.response_topic {
            w.write_u8(PropertyId::ResponseTopic as u8);
            w.write_string(v);
        }
        if let Some(v) = &self.correlation_data {
            w.write_u8(PropertyId::CorrelationData as u8);
            w.write_binary(v);
        }
        for id in &self.subscription_identifier {
            w.write_u8(PropertyId::SubscriptionIdentifier as u8);
            w.write_varint(*id);
        }
        if let Some(v) = self.session_expiry_interval {
            w.write_u8(PropertyId::SessionExpiryInterval as u8);
            w.write_u32(v);
        }
        if let Some(v) = &self.assigned_client_identifier {
            w.write_u8(PropertyId::AssignedClientIdentifier as u8);
            w.write_string(v);
        }
        if let Some(v) = self.server_keep_alive {
            w.write_u8(PropertyId::ServerKeepAlive as u8);
            w.write_u16(v);
        }
        if let Some(v) = &self.authentication_method {
            w.write_u8(PropertyId::AuthenticationMethod as u8);
            w.write_string(v);
        }
        if let Some(v) = &self.authentication_data {
            w.write_u8(PropertyId::AuthenticationData as u8);
            w.write_binary(v);
        }
        if let Some(v) = self.request_problem_information {
            w.write_u8(PropertyId::RequestProblemInformation as u8);
            w.write_bool(v);
        }
        if let Some(v) = self.will_delay_interval {
            w.write_u8(PropertyId::WillDelayInterval as u8);
            w.write_u32(v);
        }
        if let Some(v) = self.request_response_information {
            w.write_u8(PropertyId::RequestResponseInformation as u8);
            w.write_bool(v);
        }
        if let Some(v) = &self.response_information {
            w.write_u8(PropertyId::ResponseInformation as u8);
            w.write_string(v);
        }
        if let Some(v) = &self.server_reference {
            w.write_u8(PropertyId::ServerReference as u8);
            w.write_string(v);
        }
        if let Some(v) = &self.reason_string {
            w.write_u8(PropertyId::ReasonString as u8);
            w.write_string(v);
        }
        if let Some(v) = self.receive_maximum {
            w.write_u8(PropertyId::ReceiveMaximum as u8);
            w.write_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            w.write_u8(PropertyId::TopicAliasMaximum as u8);
            w.write_u16(v);
        }
        if let Some(v) = self.topic_alias {
            w.write_u8(PropertyId::TopicAlias as u8);
            w.write_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            w.write_u8(PropertyId::MaximumQoS as u8);
            w.write_u8(v);
        }
        if let Some(v) = self.retain_available {
            w.write_u8(PropertyId::RetainAvailable as u8);
            w.write_bool(v);
        }
        for (k, v) in &self.user_properties {
            w.write_u8(PropertyId::UserProperty as u8);
            w.write_string(k);
            w.write_string(v);
        }
        if let Some(v) = self.maximum_packet_size {
            w.write_u8(PropertyId::MaximumPacketSize as u8);
            w.write_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            w.write_u8(PropertyId::WildcardSubscriptionAvailable as u8);
            w.write_bool(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            w.write_u8(PropertyId::SubscriptionIdentifierAvailable as u8);
            w.write_bool(v);
        }
        if let Some(v) = self.shared_subscription_available {
            w.write_u8(PropertyId::SharedSubscriptionAvailable as u8);
            w.write_bool(v);
        }
    }
}
