//! Record framing over a reliable byte stream.
//!
//! The peer protocol wants a multi-stream transport: every message
//! belongs to one logical stream and arrives whole. [`RecordSock`]
//! provides that over any reliable byte stream (a TCP connection, or an
//! in-memory duplex in tests) by prefixing each message with a
//! [`RecordHeader`]: stream id, then payload length.
//!
//! The reader is the sole owner of the receive side and its message
//! boundary. The writer is cheap to clone; a lock serializes whole
//! records, which also serializes sends within each stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use zerocopy::{AsBytes, FromBytes};

use hycast_core::wire::RecordHeader;
use hycast_core::{Error, Result};

/// Largest record payload the reader will accept. The biggest legitimate
/// message is a chunk record: 12 bytes of metadata plus a chunk body.
pub const MAX_RECORD_LEN: u32 = 128 * 1024;

const HEADER_LEN: usize = std::mem::size_of::<RecordHeader>();

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

// ── RecordSock ───────────────────────────────────────────────────────────────

/// A record-framed view of one reliable connection.
pub struct RecordSock {
    reader: RecordReader,
    writer: RecordWriter,
    remote: Option<SocketAddr>,
}

impl RecordSock {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(Box::new(read_half), Box::new(write_half), remote)
    }

    pub fn from_parts(reader: Reader, writer: Writer, remote: Option<SocketAddr>) -> Self {
        RecordSock {
            reader: RecordReader { io: reader },
            writer: RecordWriter {
                io: Arc::new(tokio::sync::Mutex::new(writer)),
            },
            remote,
        }
    }

    /// An in-memory connected pair. Used by tests.
    pub fn pair() -> (RecordSock, RecordSock) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::from_parts(Box::new(a_read), Box::new(a_write), None),
            Self::from_parts(Box::new(b_read), Box::new(b_write), None),
        )
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn split(self) -> (RecordReader, RecordWriter, Option<SocketAddr>) {
        (self.reader, self.writer, self.remote)
    }
}

// ── RecordReader ─────────────────────────────────────────────────────────────

/// The receive side. Exactly one owner; the current record boundary is
/// whatever `next_record` last returned.
pub struct RecordReader {
    io: Reader,
}

impl RecordReader {
    /// Reads the next record header: (stream id, payload length).
    /// Returns None when the remote end closed the connection at a
    /// record boundary.
    pub async fn next_record(&mut self) -> Result<Option<(u16, u32)>> {
        let mut buf = [0u8; HEADER_LEN];
        // A zero-byte first read is a clean close; anything shorter than
        // a header after that is a truncated stream.
        let n = self.io.read(&mut buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.io.read_exact(&mut buf[1..]).await?;
        let header = RecordHeader::read_from(&buf[..])
            .ok_or_else(|| Error::runtime("malformed record header"))?;
        let len = header.len.get();
        if len > MAX_RECORD_LEN {
            return Err(Error::runtime(format!(
                "record of {len} bytes exceeds the {MAX_RECORD_LEN}-byte maximum"
            )));
        }
        Ok(Some((header.stream_id.get(), len)))
    }

    /// Reads the payload of the record whose header was just returned.
    pub async fn read_body(&mut self, len: u32) -> Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.io.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

// ── RecordWriter ─────────────────────────────────────────────────────────────

/// The send side. Cheap to clone; a lock makes each record atomic on the
/// wire.
#[derive(Clone)]
pub struct RecordWriter {
    io: Arc<tokio::sync::Mutex<Writer>>,
}

impl RecordWriter {
    /// Writes one record on the given stream.
    pub async fn send(&self, stream_id: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_RECORD_LEN as usize {
            return Err(Error::invalid_argument(format!(
                "record of {} bytes exceeds the {MAX_RECORD_LEN}-byte maximum",
                payload.len()
            )));
        }
        let header = RecordHeader::new(stream_id, payload.len() as u32);
        let mut io = self.io.lock().await;
        io.write_all(header.as_bytes()).await?;
        io.write_all(payload).await?;
        io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_round_trip() {
        let (a, b) = RecordSock::pair();
        let (_, writer, _) = a.split();
        let (mut reader, _, _) = b.split();

        writer.send(3, b"request").await.unwrap();
        writer.send(5, &[0u8; 2000]).await.unwrap();

        let (stream_id, len) = reader.next_record().await.unwrap().unwrap();
        assert_eq!((stream_id, len), (3, 7));
        assert_eq!(&reader.read_body(len).await.unwrap()[..], b"request");

        let (stream_id, len) = reader.next_record().await.unwrap().unwrap();
        assert_eq!((stream_id, len), (5, 2000));
        assert_eq!(reader.read_body(len).await.unwrap().len(), 2000);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, b) = RecordSock::pair();
        drop(a);
        let (mut reader, _, _) = b.split();
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_record_is_rejected() {
        let (a, _b) = RecordSock::pair();
        let (_, writer, _) = a.split();
        let huge = vec![0u8; MAX_RECORD_LEN as usize + 1];
        let err = writer.send(0, &huge).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got {err}");
    }

    #[tokio::test]
    async fn empty_records_are_legal() {
        let (a, b) = RecordSock::pair();
        let (_, writer, _) = a.split();
        let (mut reader, _, _) = b.split();

        writer.send(1, b"").await.unwrap();
        let (stream_id, len) = reader.next_record().await.unwrap().unwrap();
        assert_eq!((stream_id, len), (1, 0));
        assert!(reader.read_body(0).await.unwrap().is_empty());
    }
}
