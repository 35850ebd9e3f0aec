use embedded_io_async::Read;

use crate::codec::property::Properties;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::error::CodecError;
use crate::types::{PacketId, ProtocolVersion, QoS, ReasonCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    /// 0 = send retained always, 1 = send only on new subscription, 2 =
    /// never send. v3 has no such concept; always 0 there.
    pub retain_handling: u8,
}

impl SubscribeFilter {
    fn to_byte(self) -> u8 {
        let mut byte = self.qos.as_u8();
        if self.no_local {
            byte |= 0x04;
        }
        if self.retain_as_published {
            byte |= 0x08;
        }
        byte |= (self.retain_handling & 0x03) << 4;
        byte
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        let qos = QoS::try_from_u8(byte & 0x03).ok_or(CodecError::MalformedString)?;
        Ok(Self {
            qos,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling: (byte >> 4) & 0x03,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub filters: Vec<(String, SubscribeFilter)>,
}

impl Subscribe {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let raw_id = reader.read_u16().await?;
        let packet_id = PacketId::new(raw_id).ok_or(CodecError::MissingPacketId)?;

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while reader.remaining() > 0 {
            let filter = reader.read_string().await?;
            let options = reader.read_u8().await?;
            filters.push((filter, SubscribeFilter::from_byte(options)?));
        }
        if filters.is_empty() {
            return Err(CodecError::LengthMismatch);
        }

        Ok(Self {
            packet_id,
            properties,
            filters,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_packet_id(self.packet_id);
        if protocol_version.is_v5() {
            self.properties.encode(&mut w);
        }
        for (filter, options) in &self.filters {
            w.write_string(filter);
            w.write_u8(options.to_byte());
        }
        w.finish_with_fixed_header(0x82)
    }
}

fn v3_suback_code_to_reason(byte: u8) -> Result<ReasonCode, CodecError> {
    Ok(match byte {
        0 => ReasonCode::Success,
        1 => ReasonCode::GrantedQoS1,
        2 => ReasonCode::GrantedQoS2,
        0x80 => ReasonCode::UnspecifiedError,
        other => return Err(CodecError::UnknownProperty(other)),
    })
}

fn reason_to_v3_suback_code(reason: ReasonCode) -> u8 {
    match reason {
        ReasonCode::Success => 0,
        ReasonCode::GrantedQoS1 => 1,
        ReasonCode::GrantedQoS2 => 2,
        _ => 0x80,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub reason_codes: Vec<ReasonCode>,
}

impl SubAck {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let raw_id = reader.read_u16().await?;
        let packet_id = PacketId::new(raw_id).ok_or(CodecError::MissingPacketId)?;

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        let mut reason_codes = Vec::new();
        while reader.remaining() > 0 {
            let byte = reader.read_u8().await?;
            let reason = if protocol_version.is_v5() {
                ReasonCode::try_from_u8(byte).ok_or(CodecError::MalformedString)?
            } else {
                v3_suback_code_to_reason(byte)?
            };
            reason_codes.push(reason);
        }

        Ok(Self {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_packet_id(self.packet_id);
        if protocol_version.is_v5() {
            self.properties.encode(&mut w);
        }
        for reason in &self.reason_codes {
            let byte = if protocol_version.is_v5() {
                reason.as_u8()
            } else {
                reason_to_v3_suback_code(*reason)
            };
            w.write_u8(byte);
        }
        w.finish_with_fixed_header(0x90)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let raw_id = reader.read_u16().await?;
        let packet_id = PacketId::new(raw_id).ok_or(CodecError::MissingPacketId)?;

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while reader.remaining() > 0 {
            filters.push(reader.read_string().await?);
        }
        if filters.is_empty() {
            return Err(CodecError::LengthMismatch);
        }

        Ok(Self {
            packet_id,
            properties,
            filters,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_packet_id(self.packet_id);
        if protocol_version.is_v5() {
            self.properties.encode(&mut w);
        }
        for filter in &self.filters {
            w.write_string(filter);
        }
        w.finish_with_fixed_header(0xA2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubAck {
    pub packet_id: PacketId,
    pub properties: Properties,
    /// Empty for v3.1.1, which has no UNSUBACK payload at all.
    pub reason_codes: Vec<ReasonCode>,
}

impl UnsubAck {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let raw_id = reader.read_u16().await?;
        let packet_id = PacketId::new(raw_id).ok_or(CodecError::MissingPacketId)?;

        if !protocol_version.is_v5() {
            return Ok(Self {
                packet_id,
                properties: Properties::default(),
                reason_codes: Vec::new(),
            });
        }

        let properties = Properties::decode(reader).await?;
        let mut reason_codes = Vec::new();
        while reader.remaining() > 0 {
            let byte = reader.read_u8().await?;
            reason_codes.push(ReasonCode::try_from_u8(byte).ok_or(CodecError::MalformedString)?);
        }

        Ok(Self {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_packet_id(self.packet_id);
        if protocol_version.is_v5() {
            self.properties.encode(&mut w);
            for reason in &self.reason_codes {
                w.write_u8(reason.as_u8());
            }
        }
        w.finish_with_fixed_header(0xB0)
    }
}
