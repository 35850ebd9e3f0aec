use embedded_io_async::Read;

use crate::codec::property::Properties;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::error::CodecError;
use crate::types::{ProtocolVersion, ReasonCode};

/// DISCONNECT: no body at all in v3.1.1. In v5, both the reason code and
/// property block are optional — a zero-length packet means Success with
/// no properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        if !protocol_version.is_v5() || reader.remaining() == 0 {
            return Ok(Self {
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
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        if protocol_version.is_v5()
            && (self.reason_code != ReasonCode::Success || !self.properties.is_empty())
        {
            w.write_u8(self.reason_code.as_u8());
            self.properties.encode(&mut w);
        }
        w.finish_with_fixed_header(0xE0)
    }
}

/// AUTH, v5 only, used for the enhanced authentication exchange. Reason
/// code is one of `Success` / `ContinueAuthentication` / `ReAuthenticate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Auth {
    pub async fn decode<R: Read>(reader: &mut PacketReader<'_, R>) -> Result<Self, CodecError> {
        if reader.remaining() == 0 {
            return Ok(Self {
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
            reason_code,
            properties,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            w.write_u8(self.reason_code.as_u8());
            self.properties.encode(&mut w);
        }
        w.finish_with_fixed_header(0xF0)
    }
}
