use embedded_io_async::Read;

use crate::codec::property::Properties;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::error::CodecError;
use crate::types::{PacketId, ProtocolVersion, QoS};

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<PacketId>,
    /// v5 properties: payload format indicator, message expiry interval,
    /// topic alias, response topic, correlation data, user properties,
    /// subscription identifier(s), content type.
    pub properties: Properties,
    pub payload: Vec<u8>,
}

impl Publish {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        flags: u8,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::try_from_u8((flags >> 1) & 0x03).ok_or(CodecError::MalformedString)?;
        let retain = flags & 0x01 != 0;

        let topic = reader.read_string().await?;

        let packet_id = if qos.requires_packet_id() {
            let raw = reader.read_u16().await?;
            Some(PacketId::new(raw).ok_or(CodecError::MissingPacketId)?)
        } else {
            None
        };

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        let payload = reader.read_rest().await?;

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut flags = 0u8;
        if self.dup {
            flags |= 0x08;
        }
        flags |= self.qos.as_u8() << 1;
        if self.retain {
            flags |= 0x01;
        }

        let mut w = PacketWriter::new();
        w.write_string(&self.topic);
        if let Some(id) = self.packet_id {
            w.write_packet_id(id);
        }
        if protocol_version.is_v5() {
            self.properties.encode(&mut w);
        }
        w.write_raw(&self.payload);

        w.finish_with_fixed_header(0x30 | flags)
    }
}
