use embedded_io_async::Read;

use crate::codec::property::Properties;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::error::CodecError;
use crate::types::{PacketId, ProtocolVersion, ReasonCode};

/// The common shape of PUBACK, PUBREC, PUBREL and PUBCOMP: a packet id
/// plus, in v5 only, an optional reason code and property block. v5
/// allows the reduced two-byte form (packet id only) when the reason is
/// Success and there are no properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub packet_id: PacketId,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Ack {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let raw_id = reader.read_u16().await?;
        let packet_id = PacketId::new(raw_id).ok_or(CodecError::MissingPacketId)?;

        if !protocol_version.is_v5() || reader.remaining() == 0 {
            return Ok(Self {
                packet_id,
                reason_code: ReasonCode::Success,
                properties: Properties::default(),
            });
        }

        let code = reader.read_u8().await?;
        let reason_code = ReasonCode::try_from_u8(code).ok_or(CodecError::MalformedString)?;

        let properties = if reader.remaining() > 0 {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, type_and_flags: u8, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_packet_id(self.packet_id);

        if protocol_version.is_v5()
            && (self.reason_code != ReasonCode::Success || !self.properties.is_empty())
        {
            w.write_u8(self.reason_code.as_u8());
            self.properties.encode(&mut w);
        }

        w.finish_with_fixed_header(type_and_flags)
    }
}
