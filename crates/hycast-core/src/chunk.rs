//! Chunk carriers.
//!
//! An [`ActualChunk`] holds its bytes and is what senders ship. A
//! [`LatentChunk`] is what receivers get: chunk information plus the
//! still-undrained payload of the message it arrived in. A latent chunk
//! must be drained (or discarded) exactly once before the receive loop
//! moves to the next message; the loops assert this after every dispatch.

use bytes::Bytes;

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::prod::{ChunkInfo, ChunkSize};
use crate::Serial;

// ── ActualChunk ──────────────────────────────────────────────────────────────

/// A chunk of data with its bytes in hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualChunk {
    info: ChunkInfo,
    data: Bytes,
}

impl ActualChunk {
    pub fn new(info: ChunkInfo, data: Bytes) -> Result<Self> {
        if data.len() > ChunkSize::MAX as usize {
            return Err(Error::invalid_argument(format!(
                "chunk body of {} bytes exceeds the {}-byte maximum",
                data.len(),
                ChunkSize::MAX
            )));
        }
        Ok(ActualChunk { info, data })
    }

    pub fn info(&self) -> &ChunkInfo {
        &self.info
    }

    pub fn size(&self) -> ChunkSize {
        self.data.len() as ChunkSize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes the encoded form occupies: chunk information followed by the
    /// raw body, whose length is implied by the information.
    pub fn serial_size(&self, version: u32) -> usize {
        self.info.serial_size(version) + self.data.len()
    }

    pub fn encode(&self, enc: &mut Encoder, version: u32) -> Result<()> {
        self.info.encode(enc, version)?;
        enc.put_raw(&self.data);
        Ok(())
    }
}

// ── LatentChunk ──────────────────────────────────────────────────────────────

/// A chunk of data whose bytes are still sitting in the receive buffer.
///
/// The payload can be taken exactly once. `has_data()` reports whether it
/// is still pending; the receive loops fail the session if a dispatch
/// callback returns without draining.
#[derive(Debug)]
pub struct LatentChunk {
    info: ChunkInfo,
    size: ChunkSize,
    data: Option<Bytes>,
}

impl LatentChunk {
    pub fn new(info: ChunkInfo, data: Bytes) -> Result<Self> {
        if data.len() > ChunkSize::MAX as usize {
            return Err(Error::runtime(format!(
                "chunk body of {} bytes exceeds the {}-byte maximum",
                data.len(),
                ChunkSize::MAX
            )));
        }
        Ok(LatentChunk {
            info,
            size: data.len() as ChunkSize,
            data: Some(data),
        })
    }

    /// Reads the chunk information then adopts the rest of the message as
    /// the body.
    pub fn decode(dec: &mut Decoder, version: u32) -> Result<Self> {
        let info = ChunkInfo::decode(dec, version)?;
        LatentChunk::new(info, dec.rest())
    }

    pub fn info(&self) -> &ChunkInfo {
        &self.info
    }

    pub fn size(&self) -> ChunkSize {
        self.size
    }

    /// True until the payload has been drained or discarded.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Takes the payload.
    pub fn drain(&mut self) -> Result<Bytes> {
        self.data
            .take()
            .ok_or_else(|| Error::logic("latent chunk was already drained"))
    }

    /// Copies the payload into `dst`, which must be exactly the chunk's
    /// size.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.size as usize {
            return Err(Error::invalid_argument(format!(
                "destination is {} bytes; chunk is {}",
                dst.len(),
                self.size
            )));
        }
        let data = self.drain()?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    /// Throws the payload away. Used by receivers that already hold the
    /// chunk.
    pub fn discard(&mut self) {
        self.data = None;
    }
}
