//! Product and chunk identifiers and geometry.
//!
//! A product is a named immutable byte string identified by a
//! [`ProdIndex`]. It is transferred as a sequence of chunks no larger
//! than the canonical chunk size; the last chunk may be shorter.

use std::fmt;
use std::sync::OnceLock;

use crate::codec::{Decoder, Encoder, Serial};
use crate::error::{Error, Result};

/// Byte length of a product.
pub type ProdSize = u32;

/// Zero-based position of a chunk within its product.
pub type ChunkIndex = u32;

/// Byte length of a chunk.
pub type ChunkSize = u16;

/// Default canonical chunk size: the largest chunk body that fits a UDP
/// datagram alongside its metadata with room to spare.
pub const DEFAULT_CANON_CHUNK_SIZE: ChunkSize = 32760;

static CANON_CHUNK_SIZE: OnceLock<ChunkSize> = OnceLock::new();

/// Returns the process-wide canonical chunk size.
pub fn canon_chunk_size() -> ChunkSize {
    *CANON_CHUNK_SIZE.get_or_init(|| DEFAULT_CANON_CHUNK_SIZE)
}

/// Sets the process-wide canonical chunk size. May be called at most once,
/// before any I/O; the value is fixed for the life of the process.
pub fn set_canon_chunk_size(size: ChunkSize) -> Result<()> {
    if size == 0 {
        return Err(Error::invalid_argument(
            "canonical chunk size must be positive",
        ));
    }
    CANON_CHUNK_SIZE
        .set(size)
        .map_err(|_| Error::logic("canonical chunk size is already set"))
}

/// Number of chunks a product of `prod_size` bytes occupies at the given
/// chunk size.
pub fn num_chunks(prod_size: ProdSize, chunk_size: ChunkSize) -> u32 {
    let chunk_size = chunk_size as u64;
    ((prod_size as u64 + chunk_size - 1) / chunk_size) as u32
}

// ── ProdIndex ────────────────────────────────────────────────────────────────

/// 32-bit product identifier.
///
/// `next`/`prev` wrap modulo 2^32 so a long-running sender never exhausts
/// the space, but ordering is plain unsigned comparison: after the index
/// wraps, newly published products compare lower than old ones. Callers
/// that outlive a wrap must not rely on `Ord` tracking publication order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProdIndex(u32);

impl ProdIndex {
    pub fn new(index: u32) -> Self {
        ProdIndex(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        ProdIndex(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> Self {
        ProdIndex(self.0.wrapping_sub(1))
    }
}

impl From<u32> for ProdIndex {
    fn from(index: u32) -> Self {
        ProdIndex(index)
    }
}

impl fmt::Display for ProdIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serial for ProdIndex {
    fn serial_size(&self, _version: u32) -> usize {
        4
    }

    fn encode(&self, enc: &mut Encoder, _version: u32) -> Result<()> {
        enc.put_u32(self.0);
        Ok(())
    }

    fn decode(dec: &mut Decoder, _version: u32) -> Result<Self> {
        Ok(ProdIndex(dec.u32()?))
    }
}

// ── ProdInfo ─────────────────────────────────────────────────────────────────

/// Metadata describing one product: name, index, total size, and the
/// chunk size it was sharded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProdInfo {
    name: String,
    index: ProdIndex,
    size: ProdSize,
    chunk_size: ChunkSize,
}

impl ProdInfo {
    pub fn new(
        name: impl Into<String>,
        index: ProdIndex,
        size: ProdSize,
        chunk_size: ChunkSize,
    ) -> Result<Self> {
        let name = name.into();
        if name.len() > u16::MAX as usize {
            return Err(Error::invalid_argument(format!(
                "product name is {} bytes; maximum is {}",
                name.len(),
                u16::MAX
            )));
        }
        if chunk_size == 0 {
            return Err(Error::invalid_argument("chunk size must be positive"));
        }
        Ok(ProdInfo {
            name,
            index,
            size,
            chunk_size,
        })
    }

    /// Metadata synthesized from a chunk alone, before the real product
    /// information has been seen. The name is unknown and the chunk size
    /// is the canonical one.
    pub fn from_chunk_info(info: &ChunkInfo) -> Self {
        ProdInfo {
            name: String::new(),
            index: info.prod_index(),
            size: info.prod_size(),
            chunk_size: canon_chunk_size(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> ProdIndex {
        self.index
    }

    pub fn size(&self) -> ProdSize {
        self.size
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> u32 {
        num_chunks(self.size, self.chunk_size)
    }

    /// Byte offset of the given chunk within the product.
    pub fn offset_of(&self, chunk_index: ChunkIndex) -> u64 {
        chunk_index as u64 * self.chunk_size as u64
    }

    /// Byte length of the given chunk under this product's geometry.
    pub fn chunk_size_at(&self, chunk_index: ChunkIndex) -> Result<ChunkSize> {
        let offset = self.offset_of(chunk_index);
        if offset >= self.size as u64 {
            return Err(Error::invalid_argument(format!(
                "chunk index {chunk_index} is out of range for product {} of {} bytes",
                self.index, self.size
            )));
        }
        let remaining = self.size as u64 - offset;
        Ok(remaining.min(self.chunk_size as u64) as ChunkSize)
    }

    /// Information on the given chunk of this product, validated against
    /// this product's own geometry.
    pub fn chunk_info(&self, chunk_index: ChunkIndex) -> Result<ChunkInfo> {
        if chunk_index != 0 && chunk_index >= self.num_chunks() {
            return Err(Error::invalid_argument(format!(
                "chunk index {chunk_index} >= chunk count {}",
                self.num_chunks()
            )));
        }
        Ok(ChunkInfo {
            prod_index: self.index,
            prod_size: self.size,
            chunk_index,
        })
    }
}

impl fmt::Display for ProdInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name={:?}, index={}, size={}, chunkSize={}}}",
            self.name, self.index, self.size, self.chunk_size
        )
    }
}

impl Serial for ProdInfo {
    fn serial_size(&self, version: u32) -> usize {
        self.index.serial_size(version) + 4 + 2 + 2 + self.name.len()
    }

    fn encode(&self, enc: &mut Encoder, version: u32) -> Result<()> {
        // Keep consonant with decode().
        self.index.encode(enc, version)?;
        enc.put_u32(self.size);
        enc.put_u16(self.chunk_size);
        enc.put_u16(self.name.len() as u16);
        enc.put_raw(self.name.as_bytes());
        Ok(())
    }

    fn decode(dec: &mut Decoder, version: u32) -> Result<Self> {
        let index = ProdIndex::decode(dec, version)?;
        let size = dec.u32()?;
        let chunk_size = dec.u16()?;
        let name_len = dec.u16()? as usize;
        let name_bytes = dec.raw(name_len)?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| Error::runtime("product name is not valid UTF-8"))?;
        ProdInfo::new(name, index, size, chunk_size)
    }
}

// ── ChunkInfo ────────────────────────────────────────────────────────────────

/// Identifies one chunk of one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkInfo {
    prod_index: ProdIndex,
    prod_size: ProdSize,
    chunk_index: ChunkIndex,
}

impl ChunkInfo {
    /// Constructs, validating the chunk index against the canonical chunk
    /// geometry. Index zero is always accepted so that a chunk of an
    /// empty product can still be named.
    pub fn new(prod_index: ProdIndex, prod_size: ProdSize, chunk_index: ChunkIndex) -> Result<Self> {
        let chunks = num_chunks(prod_size, canon_chunk_size());
        if chunk_index != 0 && chunk_index >= chunks {
            return Err(Error::invalid_argument(format!(
                "chunk index {chunk_index} >= chunk count {chunks} \
                 (product size {prod_size})"
            )));
        }
        Ok(ChunkInfo {
            prod_index,
            prod_size,
            chunk_index,
        })
    }

    pub fn prod_index(&self) -> ProdIndex {
        self.prod_index
    }

    pub fn prod_size(&self) -> ProdSize {
        self.prod_size
    }

    pub fn chunk_index(&self) -> ChunkIndex {
        self.chunk_index
    }

    /// Byte offset of this chunk under the canonical geometry.
    pub fn offset(&self) -> u64 {
        self.chunk_index as u64 * canon_chunk_size() as u64
    }

    /// Byte length of this chunk: the canonical size, except for a short
    /// final chunk.
    pub fn size(&self) -> ChunkSize {
        let remaining = (self.prod_size as u64).saturating_sub(self.offset());
        remaining.min(canon_chunk_size() as u64) as ChunkSize
    }
}

/// Chunks order by (product index, chunk index); the product size is an
/// attribute, not part of the position.
impl Ord for ChunkInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.prod_index, self.chunk_index).cmp(&(other.prod_index, other.chunk_index))
    }
}

impl PartialOrd for ChunkInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{prodIndex={}, chunkIndex={}, size={}}}",
            self.prod_index,
            self.chunk_index,
            self.size()
        )
    }
}

impl Serial for ChunkInfo {
    fn serial_size(&self, version: u32) -> usize {
        self.prod_index.serial_size(version) + 4 + 4
    }

    fn encode(&self, enc: &mut Encoder, version: u32) -> Result<()> {
        self.prod_index.encode(enc, version)?;
        enc.put_u32(self.prod_size);
        enc.put_u32(self.chunk_index);
        Ok(())
    }

    fn decode(dec: &mut Decoder, version: u32) -> Result<Self> {
        let prod_index = ProdIndex::decode(dec, version)?;
        let prod_size = dec.u32()?;
        let chunk_index = dec.u32()?;
        ChunkInfo::new(prod_index, prod_size, chunk_index)
    }
}
