use embedded_io_async::Read;

use crate::codec::ack::Ack;
use crate::codec::connect::{ConnAck, Connect};
use crate::codec::control::{Auth, Disconnect};
use crate::codec::publish::Publish;
use crate::codec::reader::PacketReader;
use crate::codec::subscribe::{SubAck, Subscribe, UnsubAck, Unsubscribe};
use crate::error::CodecError;
use crate::types::{ProtocolVersion, VarInt};

/// One decoded MQTT control packet, tagged by type.
/// PINGREQ/PINGRESP carry no body and are represented as unit variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PubRec(_) => "PUBREC",
            Self::PubRel(_) => "PUBREL",
            Self::PubComp(_) => "PUBCOMP",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::SubAck(_) => "SUBACK",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::UnsubAck(_) => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect(_) => "DISCONNECT",
            Self::Auth(_) => "AUTH",
        }
    }
}

async fn read_varint_remaining_length<R: Read>(transport: &mut R) -> Result<u32, CodecError> {
    let mut shift = 0u32;
    let mut value: u32 = 0;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        transport
            .read_exact(&mut byte)
            .await
            .map_err(|_| CodecError::UnexpectedEof)?;
        let byte = byte[0];
        value += (byte as u32 & 0x7F) << shift;
        if byte & 0x80 == 0 {
            if value > VarInt::MAX {
                return Err(CodecError::VarIntTooLong);
            }
            return Ok(value);
        }
        shift += 7;
    }
    Err(CodecError::VarIntTooLong)
}

/// Reads one complete packet off `transport`. `max_incoming_packet` bounds
/// the remaining-length before any body bytes are read, so an oversized
/// claim is rejected without buffering attacker-controlled data.
pub async fn read_packet<R: Read>(
    transport: &mut R,
    protocol_version: ProtocolVersion,
    max_incoming_packet: u32,
) -> Result<Packet, CodecError> {
    let mut header_byte = [0u8; 1];
    transport
        .read_exact(&mut header_byte)
        .await
        .map_err(|_| CodecError::UnexpectedEof)?;
    let header_byte = header_byte[0];
    let packet_type = header_byte >> 4;
    let flags = header_byte & 0x0F;

    let remaining_length = read_varint_remaining_length(transport).await?;
    if remaining_length > max_incoming_packet {
        return Err(CodecError::PacketTooLarge);
    }

    let mut reader = PacketReader::new(transport, remaining_length as usize);

    let packet = match packet_type {
        1 => Packet::Connect(Connect::decode(&mut reader).await?),
        2 => Packet::ConnAck(ConnAck::decode(&mut reader, protocol_version).await?),
        3 => Packet::Publish(Publish::decode(&mut reader, flags, protocol_version).await?),
        4 => Packet::PubAck(Ack::decode(&mut reader, protocol_version).await?),
        5 => Packet::PubRec(Ack::decode(&mut reader, protocol_version).await?),
        6 => Packet::PubRel(Ack::decode(&mut reader, protocol_version).await?),
        7 => Packet::PubComp(Ack::decode(&mut reader, protocol_version).await?),
        8 => Packet::Subscribe(Subscribe::decode(&mut reader, protocol_version).await?),
        9 => Packet::SubAck(SubAck::decode(&mut reader, protocol_version).await?),
        10 => Packet::Unsubscribe(Unsubscribe::decode(&mut reader, protocol_version).await?),
        11 => Packet::UnsubAck(UnsubAck::decode(&mut reader, protocol_version).await?),
        12 => {
            reader.ensure_exhausted()?;
            Packet::PingReq
        }
        13 => {
            reader.ensure_exhausted()?;
            Packet::PingResp
        }
        14 => Packet::Disconnect(Disconnect::decode(&mut reader, protocol_version).await?),
        15 if protocol_version.is_v5() => Packet::Auth(Auth::decode(&mut reader).await?),
        other => return Err(CodecError::UnknownPacketType((other << 4) | flags)),
    };

    reader.ensure_exhausted()?;
    Ok(packet)
}

/// Encodes a packet to its wire form, including the fixed header.
pub fn encode_packet(packet: &Packet, protocol_version: ProtocolVersion) -> Vec<u8> {
    match packet {
        Packet::Connect(p) => p.encode(protocol_version),
        Packet::ConnAck(p) => p.encode(protocol_version),
        Packet::Publish(p) => p.encode(protocol_version),
        Packet::PubAck(p) => p.encode(0x40, protocol_version),
        Packet::PubRec(p) => p.encode(0x50, protocol_version),
        Packet::PubRel(p) => p.encode(0x62, protocol_version),
        Packet::PubComp(p) => p.encode(0x70, protocol_version),
        Packet::Subscribe(p) => p.encode(protocol_version),
        Packet::SubAck(p) => p.encode(protocol_version),
        Packet::Unsubscribe(p) => p.encode(protocol_version),
        Packet::UnsubAck(p) => p.encode(protocol_version),
        Packet::PingReq => vec![0xC0, 0x00],
        Packet::PingResp => vec![0xD0, 0x00],
        Packet::Disconnect(p) => p.encode(protocol_version),
        Packet::Auth(p) => p.encode(),
    }
}
