use embedded_io_async::Read;

use crate::codec::property::Properties;
use crate::codec::reader::PacketReader;
use crate::codec::writer::PacketWriter;
use crate::error::CodecError;
use crate::types::{ProtocolVersion, QoS, ReasonCode};

/// The Will message carried in an optional CONNECT payload section:
/// the message the server publishes on this client's behalf if the
/// network connection drops without a clean DISCONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// v5 Will Properties: delay interval, payload format, expiry,
    /// content type, response topic, correlation data, user properties.
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Properties,
}

const PROTOCOL_NAME: &str = "MQTT";

impl Connect {
    pub async fn decode<R: Read>(reader: &mut PacketReader<'_, R>) -> Result<Self, CodecError> {
        let protocol_name = reader.read_string().await?;
        if protocol_name != PROTOCOL_NAME {
            return Err(CodecError::MalformedString);
        }
        let level = reader.read_u8().await?;
        let protocol_version =
            ProtocolVersion::from_level_byte(level).ok_or(CodecError::MalformedString)?;

        let flags = reader.read_u8().await?;
        let username_flag = flags & 0x80 != 0;
        let password_flag = flags & 0x40 != 0;
        let will_retain = flags & 0x20 != 0;
        let will_qos = QoS::try_from_u8((flags >> 3) & 0x03).ok_or(CodecError::MalformedString)?;
        let will_flag = flags & 0x04 != 0;
        let clean_start = flags & 0x02 != 0;

        let keep_alive = reader.read_u16().await?;

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        let client_id = reader.read_string().await?;

        let will = if will_flag {
            let will_properties = if protocol_version.is_v5() {
                Properties::decode(reader).await?
            } else {
                Properties::default()
            };
            let topic = reader.read_string().await?;
            let payload = reader.read_binary().await?;
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(reader.read_string().await?)
        } else {
            None
        };
        let password = if password_flag {
            Some(reader.read_binary().await?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            clean_start,
            keep_alive,
            client_id,
            will,
            username,
            password,
            properties,
        })
    }

    pub fn encode(&self, _protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_string(PROTOCOL_NAME);
        w.write_u8(self.protocol_version.level_byte());

        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if let Some(will) = &self.will {
            if will.retain {
                flags |= 0x20;
            }
            flags |= will.qos.as_u8() << 3;
            flags |= 0x04;
        }
        if self.clean_start {
            flags |= 0x02;
        }
        w.write_u8(flags);
        w.write_u16(self.keep_alive);

        if self.protocol_version.is_v5() {
            self.properties.encode(&mut w);
        }

        w.write_string(&self.client_id);

        if let Some(will) = &self.will {
            if self.protocol_version.is_v5() {
                will.properties.encode(&mut w);
            }
            w.write_string(&will.topic);
            w.write_binary(&will.payload);
        }
        if let Some(username) = &self.username {
            w.write_string(username);
        }
        if let Some(password) = &self.password {
            w.write_binary(password);
        }

        w.finish_with_fixed_header(0x10)
    }
}

/// CONNACK's return code, unified across v3.1.1 (a bare 0-5 enumeration)
/// and v5 (the full reason code space). Decoding maps the narrower v3
/// set onto the equivalent v5 variant so callers only deal with one type.
fn v3_code_to_reason(code: u8) -> Option<ReasonCode> {
    Some(match code {
        0 => ReasonCode::Success,
        1 => ReasonCode::UnsupportedProtocolVersion,
        2 => ReasonCode::ClientIdentifierNotValid,
        3 => ReasonCode::ServerUnavailable,
        4 => ReasonCode::BadUserNameOrPassword,
        5 => ReasonCode::NotAuthorized,
        _ => return None,
    })
}

fn reason_to_v3_code(reason: ReasonCode) -> u8 {
    match reason {
        ReasonCode::Success => 0,
        ReasonCode::UnsupportedProtocolVersion => 1,
        ReasonCode::ClientIdentifierNotValid => 2,
        ReasonCode::ServerUnavailable => 3,
        ReasonCode::BadUserNameOrPassword => 4,
        ReasonCode::NotAuthorized => 5,
        _ => 5,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    pub async fn decode<R: Read>(
        reader: &mut PacketReader<'_, R>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let ack_flags = reader.read_u8().await?;
        let session_present = ack_flags & 0x01 != 0;
        let code = reader.read_u8().await?;

        let reason_code = if protocol_version.is_v5() {
            ReasonCode::try_from_u8(code).ok_or(CodecError::MalformedString)?
        } else {
            v3_code_to_reason(code).ok_or(CodecError::MalformedString)?
        };

        let properties = if protocol_version.is_v5() {
            Properties::decode(reader).await?
        } else {
            Properties::default()
        };

        Ok(Self {
            session_present,
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(self.session_present as u8);
        if protocol_version.is_v5() {
            w.write_u8(self.reason_code.as_u8());
            self.properties.encode(&mut w);
        } else {
            w.write_u8(reason_to_v3_code(self.reason_code));
        }
        w.finish_with_fixed_header(0x20)
    }
}
