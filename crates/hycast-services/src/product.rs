//! Product reassembly.
//!
//! A [`Product`] accumulates chunks into one contiguous buffer and tracks
//! which chunk positions have been filled. Adding the same chunk twice
//! leaves the buffer byte-identical and reports a duplicate.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use hycast_core::prod::ChunkIndex;
use hycast_core::{ActualChunk, ChunkInfo, Error, LatentChunk, ProdInfo, Result};

// ── AddStatus ────────────────────────────────────────────────────────────────

/// Outcome of adding a chunk or product information.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddStatus {
    status: u32,
}

impl AddStatus {
    const IS_COMPLETE: u32 = 1;
    const IS_NEW: u32 = 2;
    const IS_DUPLICATE: u32 = 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_new(mut self) -> Self {
        self.status |= Self::IS_NEW;
        self
    }

    pub fn with_complete(mut self) -> Self {
        self.status |= Self::IS_COMPLETE;
        self
    }

    pub fn with_duplicate(mut self) -> Self {
        self.status |= Self::IS_DUPLICATE;
        self
    }

    /// The addition changed state: a previously-missing piece arrived.
    pub fn is_new(&self) -> bool {
        self.status & Self::IS_NEW != 0
    }

    /// The product now holds every chunk.
    pub fn is_complete(&self) -> bool {
        self.status & Self::IS_COMPLETE != 0
    }

    /// The piece was already present; nothing changed.
    pub fn is_duplicate(&self) -> bool {
        self.status & Self::IS_DUPLICATE != 0
    }
}

// ── Product ──────────────────────────────────────────────────────────────────

/// A data-product being reassembled (or already complete).
///
/// Cheap to clone; clones share the same buffer and bitmap.
#[derive(Debug, Clone)]
pub struct Product {
    inner: Arc<Mutex<ProductInner>>,
}

#[derive(Debug)]
struct ProductInner {
    info: ProdInfo,
    /// False while the metadata is synthesized from a chunk and the real
    /// product information has not been seen.
    named: bool,
    data: Vec<u8>,
    have: Vec<bool>,
    received: u32,
}

impl Product {
    /// Creates an empty product from its metadata.
    pub fn new(info: ProdInfo) -> Self {
        Self::build(info, true)
    }

    /// Creates an empty product from a chunk's metadata alone. The name
    /// stays empty and the geometry is canonical until the real product
    /// information arrives.
    pub fn from_chunk_info(info: &ChunkInfo) -> Self {
        Self::build(ProdInfo::from_chunk_info(info), false)
    }

    fn build(info: ProdInfo, named: bool) -> Self {
        let num_chunks = info.num_chunks() as usize;
        let size = info.size() as usize;
        Product {
            inner: Arc::new(Mutex::new(ProductInner {
                info,
                named,
                data: vec![0; size],
                have: vec![false; num_chunks],
                received: 0,
            })),
        }
    }

    /// Rebuilds a product from persisted state.
    pub(crate) fn from_parts(
        info: ProdInfo,
        named: bool,
        have: Vec<bool>,
        data: Vec<u8>,
    ) -> Result<Self> {
        if have.len() != info.num_chunks() as usize || data.len() != info.size() as usize {
            return Err(Error::runtime(format!(
                "persisted product {} has inconsistent geometry",
                info.index()
            )));
        }
        let received = have.iter().filter(|&&h| h).count() as u32;
        Ok(Product {
            inner: Arc::new(Mutex::new(ProductInner {
                info,
                named,
                data,
                have,
                received,
            })),
        })
    }

    pub fn info(&self) -> ProdInfo {
        self.inner.lock().info.clone()
    }

    /// True once real product information has been attached.
    pub fn is_named(&self) -> bool {
        self.inner.lock().named
    }

    /// Attaches real product information to a product created from a
    /// chunk. Validates agreement with what has been received so far.
    pub fn set_info(&self, info: &ProdInfo) -> Result<AddStatus> {
        let mut inner = self.inner.lock();
        if info.index() != inner.info.index() || info.size() != inner.info.size() {
            return Err(Error::invalid_argument(format!(
                "product information {info} disagrees with product {}",
                inner.info
            )));
        }
        let mut status = AddStatus::new();
        if inner.named {
            status = status.with_duplicate();
        } else if info.chunk_size() == inner.info.chunk_size() {
            inner.info = info.clone();
            inner.named = true;
            status = status.with_new();
        } else if inner.received == 0 {
            // Nothing received yet: adopt the product's own geometry.
            let num_chunks = info.num_chunks() as usize;
            inner.info = info.clone();
            inner.named = true;
            inner.have = vec![false; num_chunks];
            status = status.with_new();
        } else {
            return Err(Error::invalid_argument(format!(
                "chunk size {} disagrees with the {} chunks already received at size {}",
                info.chunk_size(),
                inner.received,
                inner.info.chunk_size()
            )));
        }
        if inner.is_complete() {
            status = status.with_complete();
        }
        Ok(status)
    }

    /// Adds a chunk of data.
    pub fn add_chunk(&self, chunk: &ActualChunk) -> Result<AddStatus> {
        let mut inner = self.inner.lock();
        let index = inner.validate(chunk.info(), chunk.size() as usize)?;
        if inner.have[index as usize] {
            return Ok(inner.status().with_duplicate());
        }
        let offset = inner.info.offset_of(index) as usize;
        inner.data[offset..offset + chunk.data().len()].copy_from_slice(chunk.data());
        Ok(inner.mark_received(index))
    }

    /// Adds a latent chunk, draining it straight into the buffer. A
    /// duplicate is discarded but still counts as consumed.
    pub fn add_latent(&self, chunk: &mut LatentChunk) -> Result<AddStatus> {
        let mut inner = self.inner.lock();
        let index = inner.validate(chunk.info(), chunk.size() as usize)?;
        if inner.have[index as usize] {
            chunk.discard();
            return Ok(inner.status().with_duplicate());
        }
        let offset = inner.info.offset_of(index) as usize;
        let len = chunk.size() as usize;
        chunk.drain_into(&mut inner.data[offset..offset + len])?;
        Ok(inner.mark_received(index))
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().is_complete()
    }

    pub fn received_count(&self) -> u32 {
        self.inner.lock().received
    }

    /// The assembled bytes. Positions of missing chunks read as zero.
    pub fn data(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().data)
    }

    pub fn have_chunk(&self, index: ChunkIndex) -> bool {
        let inner = self.inner.lock();
        inner.have.get(index as usize).copied().unwrap_or(false)
    }

    /// Returns the given chunk if it has been received.
    pub fn chunk(&self, index: ChunkIndex) -> Option<ActualChunk> {
        let inner = self.inner.lock();
        if !inner.have.get(index as usize).copied().unwrap_or(false) {
            return None;
        }
        let info = inner.info.chunk_info(index).ok()?;
        let offset = inner.info.offset_of(index) as usize;
        let len = inner.info.chunk_size_at(index).ok()? as usize;
        let data = Bytes::copy_from_slice(&inner.data[offset..offset + len]);
        ActualChunk::new(info, data).ok()
    }

    /// Consistent snapshot of the metadata and received bitmap.
    pub(crate) fn snapshot(&self) -> (ProdInfo, Vec<bool>) {
        let inner = self.inner.lock();
        (inner.info.clone(), inner.have.clone())
    }
}

impl ProductInner {
    fn is_complete(&self) -> bool {
        self.received as usize == self.have.len()
    }

    fn status(&self) -> AddStatus {
        if self.is_complete() {
            AddStatus::new().with_complete()
        } else {
            AddStatus::new()
        }
    }

    /// Checks a chunk against this product's geometry and returns its
    /// index.
    fn validate(&self, info: &ChunkInfo, body_len: usize) -> Result<ChunkIndex> {
        if info.prod_index() != self.info.index() || info.prod_size() != self.info.size() {
            return Err(Error::invalid_argument(format!(
                "chunk {info} does not belong to product {}",
                self.info
            )));
        }
        let index = info.chunk_index();
        if index as usize >= self.have.len() {
            return Err(Error::invalid_argument(format!(
                "chunk index {index} >= chunk count {}",
                self.have.len()
            )));
        }
        let expected = self.info.chunk_size_at(index)? as usize;
        if body_len != expected {
            return Err(Error::invalid_argument(format!(
                "chunk {index} body is {body_len} bytes; expected {expected}"
            )));
        }
        Ok(index)
    }

    fn mark_received(&mut self, index: ChunkIndex) -> AddStatus {
        self.have[index as usize] = true;
        self.received += 1;
        let status = self.status().with_new();
        if status.is_complete() {
            tracing::debug!(
                prod_index = %self.info.index(),
                chunks = self.have.len(),
                "product complete"
            );
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hycast_core::ProdIndex;

    fn product_info() -> ProdInfo {
        ProdInfo::new("p", ProdIndex::new(1), 128_000, 32760).unwrap()
    }

    fn chunk(info: &ProdInfo, index: ChunkIndex, fill: u8) -> ActualChunk {
        let len = info.chunk_size_at(index).unwrap() as usize;
        ActualChunk::new(
            info.chunk_info(index).unwrap(),
            Bytes::from(vec![fill; len]),
        )
        .unwrap()
    }

    #[test]
    fn chunks_assemble_in_any_order() {
        let info = product_info();
        let in_order = Product::new(info.clone());
        let shuffled = Product::new(info.clone());

        for i in [0u32, 1, 2, 3] {
            in_order.add_chunk(&chunk(&info, i, i as u8)).unwrap();
        }
        for i in [3u32, 0, 2, 1] {
            shuffled.add_chunk(&chunk(&info, i, i as u8)).unwrap();
        }

        assert!(in_order.is_complete());
        assert!(shuffled.is_complete());
        assert_eq!(in_order.data(), shuffled.data());
    }

    #[test]
    fn final_add_reports_complete() {
        let info = product_info();
        let product = Product::new(info.clone());
        for i in 0..3 {
            let status = product.add_chunk(&chunk(&info, i, 1)).unwrap();
            assert!(status.is_new());
            assert!(!status.is_complete());
        }
        let status = product.add_chunk(&chunk(&info, 3, 1)).unwrap();
        assert!(status.is_new());
        assert!(status.is_complete());
    }

    #[test]
    fn duplicate_add_changes_nothing() {
        let info = product_info();
        let product = Product::new(info.clone());
        assert!(product.add_chunk(&chunk(&info, 2, 0xaa)).unwrap().is_new());
        let before = product.data();

        let status = product.add_chunk(&chunk(&info, 2, 0xbb)).unwrap();
        assert!(status.is_duplicate());
        assert!(!status.is_new());
        assert_eq!(product.data(), before);
        assert_eq!(product.received_count(), 1);
    }

    #[test]
    fn latent_duplicate_is_discarded_but_consumed() {
        let info = product_info();
        let product = Product::new(info.clone());
        product.add_chunk(&chunk(&info, 0, 0x11)).unwrap();

        let body = vec![0x22; info.chunk_size_at(0).unwrap() as usize];
        let mut latent =
            LatentChunk::new(info.chunk_info(0).unwrap(), Bytes::from(body)).unwrap();
        let status = product.add_latent(&mut latent).unwrap();
        assert!(status.is_duplicate());
        assert!(!latent.has_data());
        // The original bytes survive.
        assert_eq!(product.data()[0], 0x11);
    }

    #[test]
    fn mismatched_chunk_is_rejected() {
        let info = product_info();
        let other = ProdInfo::new("q", ProdIndex::new(9), 128_000, 32760).unwrap();
        let product = Product::new(info);
        let err = product.add_chunk(&chunk(&other, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got {err}");
    }

    #[test]
    fn wrong_body_length_is_rejected() {
        let info = product_info();
        let product = Product::new(info.clone());
        let bad = ActualChunk::new(info.chunk_info(0).unwrap(), Bytes::from_static(b"short"))
            .unwrap();
        assert!(product.add_chunk(&bad).is_err());
    }

    #[test]
    fn set_info_names_a_chunk_derived_product() {
        let chunk_info = ChunkInfo::new(ProdIndex::new(5), 65_536, 0).unwrap();
        let product = Product::from_chunk_info(&chunk_info);
        assert!(!product.is_named());

        let info = ProdInfo::new(
            "named",
            ProdIndex::new(5),
            65_536,
            hycast_core::canon_chunk_size(),
        )
        .unwrap();
        let status = product.set_info(&info).unwrap();
        assert!(status.is_new());
        assert!(product.is_named());
        assert_eq!(product.info().name(), "named");

        // A second attach is a duplicate.
        assert!(product.set_info(&info).unwrap().is_duplicate());
    }

    #[test]
    fn set_info_rejects_disagreeing_metadata() {
        let chunk_info = ChunkInfo::new(ProdIndex::new(5), 65_536, 0).unwrap();
        let product = Product::from_chunk_info(&chunk_info);
        let wrong_size = ProdInfo::new("x", ProdIndex::new(5), 70_000, 32760).unwrap();
        assert!(product.set_info(&wrong_size).is_err());
    }

    #[test]
    fn chunk_getter_round_trips() {
        let info = product_info();
        let product = Product::new(info.clone());
        let sent = chunk(&info, 1, 0x5a);
        product.add_chunk(&sent).unwrap();

        assert!(product.have_chunk(1));
        assert!(!product.have_chunk(2));
        let got = product.chunk(1).unwrap();
        assert_eq!(got, sent);
        assert!(product.chunk(2).is_none());
    }
}
