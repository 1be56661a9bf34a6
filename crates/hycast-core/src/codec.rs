//! Length-prefixed big-endian serialization.
//!
//! Every wire message in Hycast is built from the same primitives: fixed
//! 1/2/4/8-byte big-endian integers and byte runs prefixed with a 32-bit
//! count. An `Encoder` accumulates exactly one message; `take()` commits
//! it. A `Decoder` owns exactly one received message and hands out its
//! bytes until the tail is dropped.
//!
//! The protocol version is threaded through every encode/decode call so a
//! future format change can be made without touching call sites.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Wire protocol version. Exchanged during the peer handshake; a remote
/// peer advertising any other value fails the session.
pub const PROTOCOL_VERSION: u32 = 0;

/// A type with a symmetric wire representation.
///
/// Invariant: for every value `v` and version `n`,
/// `decode(encode(v, n), n) == v` and the encoded length equals
/// `v.serial_size(n)`.
pub trait Serial: Sized {
    /// Number of bytes `encode` will write for this value.
    fn serial_size(&self, version: u32) -> usize;

    fn encode(&self, enc: &mut Encoder, version: u32) -> Result<()>;

    fn decode(dec: &mut Decoder, version: u32) -> Result<Self>;

    /// Encode into a fresh buffer. The common single-message path.
    fn to_bytes(&self, version: u32) -> Result<Bytes> {
        let mut enc = Encoder::with_capacity(self.serial_size(version));
        self.encode(&mut enc, version)?;
        Ok(enc.take())
    }

    /// Decode a value that must consume the whole buffer.
    fn from_bytes(buf: Bytes, version: u32) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let value = Self::decode(&mut dec, version)?;
        if dec.remaining() != 0 {
            return Err(Error::runtime(format!(
                "{} trailing bytes after decode",
                dec.remaining()
            )));
        }
        Ok(value)
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Accumulates one outgoing message.
#[derive(Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Encoder {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Appends a byte run with a 32-bit count prefix.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Appends raw bytes with no prefix. Used where the length is implied
    /// by metadata already written (a chunk body).
    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Commits the accumulated message, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Holds one incoming message. Reads draw from the front; whatever is
/// left when the decoder is dropped is discarded with it.
pub struct Decoder {
    buf: Bytes,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Decoder { buf }
    }

    fn expect(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::runtime(format!(
                "message truncated: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.expect(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.expect(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.expect(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.expect(8)?;
        Ok(self.buf.get_u64())
    }

    /// Reads a byte run written by [`Encoder::put_bytes`].
    pub fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.raw(len)
    }

    /// Reads `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<Bytes> {
        self.expect(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Takes the rest of the message.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_big_endian() {
        let mut enc = Encoder::new();
        enc.put_u8(0xab);
        enc.put_u16(0x0102);
        enc.put_u32(0xdead_beef);
        enc.put_u64(0x0011_2233_4455_6677);
        let bytes = enc.take();
        assert_eq!(bytes.len(), 1 + 2 + 4 + 8);
        // Big-endian on the wire.
        assert_eq!(&bytes[..3], &[0xab, 0x01, 0x02]);
        assert_eq!(&bytes[3..7], &[0xde, 0xad, 0xbe, 0xef]);

        let mut dec = Decoder::new(bytes);
        assert_eq!(dec.u8().unwrap(), 0xab);
        assert_eq!(dec.u16().unwrap(), 0x0102);
        assert_eq!(dec.u32().unwrap(), 0xdead_beef);
        assert_eq!(dec.u64().unwrap(), 0x0011_2233_4455_6677);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn byte_runs_carry_a_count_prefix() {
        let mut enc = Encoder::new();
        enc.put_bytes(b"product");
        let bytes = enc.take();
        assert_eq!(bytes.len(), 4 + 7);

        let mut dec = Decoder::new(bytes);
        assert_eq!(&dec.bytes().unwrap()[..], b"product");
    }

    #[test]
    fn truncated_reads_are_runtime_errors() {
        let mut dec = Decoder::new(Bytes::from_static(&[0x01, 0x02]));
        let err = dec.u32().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "got {err}");
    }

    #[test]
    fn take_leaves_the_encoder_reusable() {
        let mut enc = Encoder::new();
        enc.put_u32(1);
        let first = enc.take();
        assert!(enc.is_empty());
        enc.put_u32(2);
        let second = enc.take();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_ne!(first, second);
    }

    #[test]
    fn rest_drains_the_remainder() {
        let mut dec = Decoder::new(Bytes::from_static(b"\x00\x07tail"));
        dec.u16().unwrap();
        assert_eq!(&dec.rest()[..], b"tail");
        assert_eq!(dec.remaining(), 0);
    }
}
