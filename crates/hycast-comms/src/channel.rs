//! Typed views over one stream of a record socket.
//!
//! A [`Channel`] pairs a stream id with one serializable message type:
//! `send` frames a value onto that stream, `decode` interprets a record
//! payload the dispatch loop read off it. Chunks get their own
//! [`ChunkChannel`] because the send and receive sides see different
//! types (an eager [`ActualChunk`] out, a lazy [`LatentChunk`] in).

use std::marker::PhantomData;

use bytes::Bytes;

use hycast_core::wire::StreamId;
use hycast_core::{ActualChunk, Decoder, Encoder, LatentChunk, Result, Serial};

use crate::sock::RecordWriter;

// ── Channel ──────────────────────────────────────────────────────────────────

/// A typed view over one stream id.
#[derive(Debug)]
pub struct Channel<T> {
    stream_id: StreamId,
    version: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Channel<T> {}

impl<T: Serial> Channel<T> {
    pub fn new(stream_id: StreamId, version: u32) -> Self {
        Channel {
            stream_id,
            version,
            _marker: PhantomData,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Writes one framed message on this channel's stream.
    pub async fn send(&self, writer: &RecordWriter, value: &T) -> Result<()> {
        let payload = value.to_bytes(self.version)?;
        writer.send(self.stream_id.into(), &payload).await
    }

    /// Interprets a record payload received on this channel's stream.
    pub fn decode(&self, payload: Bytes) -> Result<T> {
        T::from_bytes(payload, self.version)
    }
}

// ── ChunkChannel ─────────────────────────────────────────────────────────────

/// The chunk stream: actual chunks out, latent chunks in.
#[derive(Debug, Clone, Copy)]
pub struct ChunkChannel {
    stream_id: StreamId,
    version: u32,
}

impl ChunkChannel {
    pub fn new(stream_id: StreamId, version: u32) -> Self {
        ChunkChannel { stream_id, version }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn send(&self, writer: &RecordWriter, chunk: &ActualChunk) -> Result<()> {
        let mut enc = Encoder::with_capacity(chunk.serial_size(self.version));
        chunk.encode(&mut enc, self.version)?;
        writer.send(self.stream_id.into(), &enc.take()).await
    }

    /// Interprets a record payload as chunk metadata plus a still-latent
    /// body.
    pub fn decode(&self, payload: Bytes) -> Result<LatentChunk> {
        let mut dec = Decoder::new(payload);
        LatentChunk::decode(&mut dec, self.version)
    }
}
