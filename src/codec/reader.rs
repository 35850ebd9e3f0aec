use embedded_io_async::Read;

use crate::error::CodecError;
use crate::types::VarInt;

/// Reads MQTT primitive wire types off an async byte source already
/// bounded to a single packet body. Owns no
/// buffer of its own past the one allocation each `read_binary`/
/// `read_string` call makes — there is no zero-copy borrowing here, the
/// engine runs on std and keeps decoded fields as owned `String`/`Bytes`.
pub struct PacketReader<'r, R> {
    inner: &'r mut R,
    remaining: usize,
}

impl<'r, R: Read> PacketReader<'r, R> {
    pub fn new(inner: &'r mut R, remaining_length: usize) -> Self {
        Self {
            inner,
            remaining: remaining_length,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        if buf.len() > self.remaining {
            return Err(CodecError::LengthMismatch);
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|_| CodecError::UnexpectedEof)?;
            if n == 0 {
                return Err(CodecError::UnexpectedEof);
            }
            filled += n;
        }
        self.remaining -= buf.len();
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8, CodecError> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16, CodecError> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn read_u32(&mut self) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::MalformedString),
        }
    }

    /// Variable byte integer embedded within the body (e.g. a property's
    /// Subscription Identifier), as opposed to the fixed header's
    /// remaining-length which is consumed before a [`PacketReader`] exists.
    pub async fn read_varint(&mut self) -> Result<u32, CodecError> {
        let mut shift = 0u32;
        let mut value: u32 = 0;
        for _ in 0..4 {
            let byte = self.read_u8().await?;
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

    pub async fn read_binary(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u16().await? as usize;
        if len > self.remaining {
            return Err(CodecError::LengthMismatch);
        }
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_binary().await?;
        String::from_utf8(bytes).map_err(|_| CodecError::MalformedString)
    }

    /// Reads exactly `remaining` raw bytes, for the PUBLISH payload.
    pub async fn read_rest(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.remaining;
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    pub fn ensure_exhausted(&self) -> Result<(), CodecError> {
        if self.remaining == 0 {
            Ok(())
        } else {
            Err(CodecError::LengthMismatch)
        }
    }
}
