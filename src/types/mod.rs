//! Wire-level value types shared by the codec, session, and delivery
//! layers.

mod packet_id;
mod qos;
mod reason_code;
mod topic;
mod varint;

pub use packet_id::PacketId;
pub use qos::QoS;
pub use reason_code::ReasonCode;
pub use topic::{TopicFilter, TopicName};
pub use varint::VarInt;

/// The two wire protocol versions this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V4,
    V5,
}

impl ProtocolVersion {
    pub(crate) fn level_byte(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V5 => 5,
        }
    }

    pub(crate) fn from_level_byte(byte: u8) -> Option<Self> {
        match byte {
            4 => Some(Self::V4),
            5 => Some(Self::V5),
            _ => None,
        }
    }

    pub fn is_v5(self) -> bool {
        matches!(self, Self::V5)
    }
}
