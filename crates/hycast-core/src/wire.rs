//! Fixed-size wire records and protocol constants.
//!
//! These types ARE the protocol. Every field and every size is part of
//! the wire format; changing anything here is a breaking change. The
//! variable-length messages (product info, chunk bodies) are built with
//! the codec; the fixed-size records below are laid out with zerocopy so
//! they can be read straight off a receive buffer.
//!
//! All multi-byte integers are big-endian on the wire.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Stream ids ───────────────────────────────────────────────────────────────

/// Number of logical streams a peer session uses.
pub const NUM_STREAM_IDS: u16 = 6;

/// Logical stream of a peer-session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StreamId {
    /// A single version message at session start.
    Version = 0,
    /// Product-information advertisements.
    ProdNotice = 1,
    /// Chunk-information advertisements.
    ChunkNotice = 2,
    /// Requests for product information.
    ProdReq = 3,
    /// Requests for a chunk of data.
    ChunkReq = 4,
    /// Chunks of data.
    Chunk = 5,
}

impl StreamId {
    /// Returns None for stream ids this version does not know; the
    /// receiver discards such records.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(StreamId::Version),
            1 => Some(StreamId::ProdNotice),
            2 => Some(StreamId::ChunkNotice),
            3 => Some(StreamId::ProdReq),
            4 => Some(StreamId::ChunkReq),
            5 => Some(StreamId::Chunk),
            _ => None,
        }
    }
}

impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id as u16
    }
}

// ── Record header ────────────────────────────────────────────────────────────

/// Prefix of every record on the reliable transport: which logical stream
/// the record belongs to and how many payload bytes follow.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    pub stream_id: U16,
    pub len: U32,
}

assert_eq_size!(RecordHeader, [u8; 6]);

impl RecordHeader {
    pub fn new(stream_id: u16, len: u32) -> Self {
        RecordHeader {
            stream_id: U16::new(stream_id),
            len: U32::new(len),
        }
    }
}

// ── Version message ──────────────────────────────────────────────────────────

/// Payload of the one message each side sends on [`StreamId::Version`]
/// when a session starts.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct VersionRecord {
    pub version: U32,
}

assert_eq_size!(VersionRecord, [u8; 4]);

impl VersionRecord {
    pub fn new(version: u32) -> Self {
        VersionRecord {
            version: U32::new(version),
        }
    }
}

// ── Multicast message ids ────────────────────────────────────────────────────

/// First byte of every multicast datagram: a product-information message.
pub const MSG_ID_PROD_INFO: u8 = 1;

/// First byte of every multicast datagram: a chunk message (chunk
/// information followed by the raw body).
pub const MSG_ID_CHUNK: u8 = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn record_header_round_trip() {
        let header = RecordHeader::new(5, 32772);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), 6);
        // Big-endian on the wire.
        assert_eq!(bytes, &[0x00, 0x05, 0x00, 0x00, 0x80, 0x04]);

        let recovered = RecordHeader::read_from(bytes).unwrap();
        assert_eq!(recovered.stream_id.get(), 5);
        assert_eq!(recovered.len.get(), 32772);
    }

    #[test]
    fn version_record_round_trip() {
        let record = VersionRecord::new(0);
        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), 4);
        let recovered = VersionRecord::read_from(bytes).unwrap();
        assert_eq!(recovered.version.get(), 0);
    }

    #[test]
    fn stream_ids_map_both_ways() {
        for id in 0..NUM_STREAM_IDS {
            let stream = StreamId::from_u16(id).expect("known stream id");
            assert_eq!(u16::from(stream), id);
        }
        assert!(StreamId::from_u16(NUM_STREAM_IDS).is_none());
        assert!(StreamId::from_u16(u16::MAX).is_none());
    }
}
