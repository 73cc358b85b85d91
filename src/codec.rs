//! # Message Codec
//!
//! A growable byte buffer used for every frame this engine sends, whether
//! over the driver/worker wire protocol (§6) or the sandbox's internal
//! child-to-parent result transport (§4.6). The first 8 bytes are always
//! reserved for the frame's total length so a reader can learn how much to
//! read before decoding anything else.
//!
//! Construction and cursor bookkeeping run under the resource tracker's
//! suppression guard so the codec's own heap traffic is never attributed to
//! whatever test happens to be measuring at the time.

use crate::tracker::suppressed;
use anyhow::{anyhow, Result};
use std::convert::TryInto;

const HEADER_LEN: usize = 8;

/// A length-prefixed read/write buffer.
#[derive(Debug, Default)]
pub struct Buffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl Buffer {
    /// A fresh buffer with the header reserved and the cursor positioned
    /// just past it, ready for the first `write_*` call.
    pub fn new() -> Self {
        suppressed(|| {
            let mut bytes = Vec::with_capacity(1024);
            bytes.extend_from_slice(&[0u8; HEADER_LEN]);
            Buffer { bytes, cursor: HEADER_LEN }
        })
    }

    /// Wrap an already-received frame (header included) for reading.
    pub fn from_received(bytes: Vec<u8>) -> Self {
        Buffer { bytes, cursor: HEADER_LEN }
    }

    fn reserve(&mut self, extra: usize) {
        let needed = self.cursor + extra;
        if needed > self.bytes.len() {
            suppressed(|| self.bytes.resize(needed.max(self.bytes.len() * 2).max(1024), 0));
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.bytes[self.cursor..self.cursor + data.len()].copy_from_slice(data);
        self.cursor += data.len();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_byte_string(&mut self, data: &[u8]) {
        self.write_u64(data.len() as u64);
        self.write_bytes(data);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u64((s.len() + 1) as u64);
        self.write_bytes(s.as_bytes());
        self.write_u8(0);
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.cursor).ok_or_else(|| anyhow!("buffer underrun reading u8"))?;
        self.cursor += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let v = self.take(2)?;
        Ok(u16::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self.take(4)?;
        Ok(u32::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let v = self.take(8)?;
        Ok(u64::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn read_byte_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        let raw = self.take(len)?.to_vec();
        // Drop the trailing NUL written by write_str.
        let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(&raw);
        Ok(String::from_utf8_lossy(trimmed).into_owned())
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.cursor + len;
        if end > self.bytes.len() {
            return Err(anyhow!("buffer underrun: need {} bytes, have {}", len, self.bytes.len() - self.cursor));
        }
        let slice = &self.bytes[self.cursor..end];
        self.cursor += len;
        Ok(slice)
    }

    /// Finalize the length header and return the complete frame, ready to
    /// hand to `Transport::send`.
    pub fn finish(mut self) -> Vec<u8> {
        let total = self.cursor as u64;
        self.bytes.truncate(self.cursor);
        self.bytes[..HEADER_LEN].copy_from_slice(&total.to_le_bytes());
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == HEADER_LEN
    }
}

/// Decode just the 8-byte length header from a peeked/received prefix.
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u64 {
    u64::from_le_bytes(*header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives_and_strings() {
        let mut buf = Buffer::new();
        buf.write_u32(42);
        buf.write_str("hello");
        buf.write_byte_string(&[1, 2, 3]);
        let frame = buf.finish();

        let total = decode_length(&frame[..8].try_into().unwrap());
        assert_eq!(total as usize, frame.len());

        let mut reader = Buffer::from_received(frame);
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert_eq!(reader.read_str().unwrap(), "hello");
        assert_eq!(reader.read_byte_string().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn underrun_on_short_buffer_is_an_error() {
        let mut reader = Buffer::from_received(vec![0u8; 8]);
        assert!(reader.read_u64().is_err());
    }
}
