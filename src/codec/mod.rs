//! Packet framing: fixed header, property blocks, and one module per
//! control packet shape.

pub mod ack;
pub mod connect;
pub mod control;
pub mod packet;
pub mod property;
pub mod reader;
pub mod subscribe;
pub mod publish;
pub mod writer;

pub use packet::{encode_packet, read_packet, Packet};
pub use property::Properties;
