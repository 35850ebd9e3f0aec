use crate::types::{PacketId, VarInt};

/// Accumulates an encoded packet body into an owned buffer so the fixed
/// header's remaining-length can be computed before anything touches the
/// transport. Buffers the whole body rather than precomputing its
/// length up front, since this engine runs on a heap and has no reason
/// to avoid the second pass a `no_std` target would.
#[derive(Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_packet_id(&mut self, id: PacketId) {
        self.write_u16(id.get());
    }

    pub fn write_varint(&mut self, value: u32) {
        let bytes = VarInt::new(value).expect("varint value within protocol bounds").encode();
        self.buf.extend_from_slice(bytes.as_slice());
    }

    pub fn write_binary(&mut self, bytes: &[u8]) {
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_binary(s.as_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Wraps an already-encoded body with its fixed header: packet type +
    /// flags byte, then the remaining-length variable byte integer.
    pub fn finish_with_fixed_header(self, type_and_flags: u8) -> Vec<u8> {
        let body = self.buf;
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(type_and_flags);
        let len = VarInt::new(body.len() as u32).expect("body length within protocol bounds");
        out.extend_from_slice(len.encode().as_slice());
        out.extend_from_slice(&body);
        out
    }
}

pub fn binary_len(bytes: &[u8]) -> usize {
    2 + bytes.len()
}

pub fn string_len(s: &str) -> usize {
    binary_len(s.as_bytes())
}

pub fn varint_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
