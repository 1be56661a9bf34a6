//! The product store: the receiver-side authority on products, chunks,
//! and missing-chunk state.
//!
//! Products live in an ordered map so missing-chunk queries walk in
//! (product index, chunk index) order. Every insertion schedules an
//! eviction on a shared delay queue; one eviction task pops and removes
//! products whose residence time has elapsed, complete or not.
//!
//! With a snapshot path configured, the store persists its entries on
//! close and restores them on the next construction. The snapshot is a
//! versioned binary stream written atomically (temp file, then rename).

use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use hycast_core::codec::PROTOCOL_VERSION;
use hycast_core::{
    ActualChunk, ChunkInfo, Decoder, Encoder, Error, LatentChunk, ProdIndex, ProdInfo, Result,
    Serial,
};

use crate::delay_queue::DelayQueue;
use crate::product::{AddStatus, Product};

/// Default minimum residence time of a product, in seconds.
pub const DEFAULT_RESIDENCE_SECONDS: f64 = 3600.0;

const SNAPSHOT_MAGIC: &[u8; 4] = b"HYCS";
const SNAPSHOT_VERSION: u16 = 1;

// ── ProdStore ────────────────────────────────────────────────────────────────

/// The product store. Cheap to clone; clones share the same state.
///
/// Must be created within a tokio runtime: construction spawns the
/// eviction task.
#[derive(Clone)]
pub struct ProdStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProdStore").finish_non_exhaustive()
    }
}

struct Shared {
    entries: RwLock<BTreeMap<ProdIndex, Product>>,
    residence: Duration,
    snapshot_path: Option<PathBuf>,
    expiry: DelayQueue<ProdIndex>,
    evictor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProdStore {
    /// A store with no persistence.
    pub fn new(residence_seconds: f64) -> Result<Self> {
        Self::build(None, residence_seconds)
    }

    /// A store persisted to `path` on close and restored from it now.
    /// An empty path means no persistence.
    pub fn with_snapshot(path: impl Into<PathBuf>, residence_seconds: f64) -> Result<Self> {
        let path = path.into();
        let path = (!path.as_os_str().is_empty()).then_some(path);
        Self::build(path, residence_seconds)
    }

    fn build(snapshot_path: Option<PathBuf>, residence_seconds: f64) -> Result<Self> {
        if !(residence_seconds >= 0.0) {
            return Err(Error::invalid_argument(format!(
                "residence time {residence_seconds} s is negative"
            )));
        }
        let shared = Arc::new(Shared {
            entries: RwLock::new(BTreeMap::new()),
            residence: Duration::from_secs_f64(residence_seconds),
            snapshot_path,
            expiry: DelayQueue::new(),
            evictor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Some(path) = shared.snapshot_path.clone() {
            if path.exists() {
                shared.restore(&path)?;
            }
        }

        let weak = Arc::downgrade(&shared);
        let queue = shared.expiry.clone();
        let handle = tokio::spawn(async move {
            loop {
                let index = queue.pop().await;
                let Some(shared) = weak.upgrade() else { break };
                if let Some(product) = shared.entries.write().remove(&index) {
                    tracing::debug!(
                        prod_index = %index,
                        complete = product.is_complete(),
                        "product residence expired"
                    );
                };
            }
        });
        *shared.evictor.lock() = Some(handle);

        Ok(ProdStore { shared })
    }

    /// Registers an entire product. Does nothing if the index is already
    /// present.
    pub fn add_product(&self, product: Product) {
        let index = product.info().index();
        let mut entries = self.shared.entries.write();
        if let MapEntry::Vacant(slot) = entries.entry(index) {
            slot.insert(product);
            self.shared.expiry.push(index, self.shared.residence);
        }
    }

    /// Attaches product information to an entry, creating the entry if
    /// absent. The status reports `complete` iff the entry already held
    /// every chunk.
    pub fn add_prod_info(&self, info: &ProdInfo) -> Result<(AddStatus, Product)> {
        let mut entries = self.shared.entries.write();
        match entries.entry(info.index()) {
            MapEntry::Vacant(slot) => {
                let product = Product::new(info.clone());
                let mut status = AddStatus::new().with_new();
                if product.is_complete() {
                    status = status.with_complete();
                }
                slot.insert(product.clone());
                self.shared.expiry.push(info.index(), self.shared.residence);
                Ok((status, product))
            }
            MapEntry::Occupied(slot) => {
                let product = slot.get().clone();
                let status = product.set_info(info)?;
                Ok((status, product))
            }
        }
    }

    /// Adds a latent chunk, creating the product from the chunk's own
    /// metadata if no entry exists yet.
    pub fn add_latent_chunk(&self, chunk: &mut LatentChunk) -> Result<(AddStatus, Product)> {
        let index = chunk.info().prod_index();
        let mut entries = self.shared.entries.write();
        let product = match entries.entry(index) {
            MapEntry::Vacant(slot) => {
                let product = Product::from_chunk_info(chunk.info());
                slot.insert(product.clone());
                self.shared.expiry.push(index, self.shared.residence);
                product
            }
            MapEntry::Occupied(slot) => slot.get().clone(),
        };
        let status = product.add_latent(chunk)?;
        Ok((status, product))
    }

    /// Number of products, complete and incomplete.
    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.read().is_empty()
    }

    /// Information on a product, once real information has been seen.
    pub fn prod_info(&self, index: ProdIndex) -> Option<ProdInfo> {
        let entries = self.shared.entries.read();
        let product = entries.get(&index)?;
        product.is_named().then(|| product.info())
    }

    pub fn have_chunk(&self, info: &ChunkInfo) -> bool {
        let entries = self.shared.entries.read();
        match entries.get(&info.prod_index()) {
            Some(product) if product.info().size() == info.prod_size() => {
                product.have_chunk(info.chunk_index())
            }
            _ => false,
        }
    }

    /// The chunk of data matching `info`, if present.
    pub fn chunk(&self, info: &ChunkInfo) -> Option<ActualChunk> {
        let entries = self.shared.entries.read();
        let product = entries.get(&info.prod_index())?;
        if product.info().size() != info.prod_size() {
            return None;
        }
        product.chunk(info.chunk_index())
    }

    /// Information on the oldest missing chunk: the lexicographically
    /// smallest (product index, chunk index) whose bit is clear. None if
    /// the store has no gaps.
    pub fn oldest_missing_chunk(&self) -> Option<ChunkInfo> {
        let entries = self.shared.entries.read();
        for product in entries.values() {
            let (info, have) = product.snapshot();
            if let Some(missing) = have.iter().position(|&h| !h) {
                if let Ok(chunk_info) = info.chunk_info(missing as u32) {
                    return Some(chunk_info);
                }
            }
        }
        None
    }

    /// Forward walk over the chunks present in the store, starting at
    /// `start` (or the beginning). Iterates a snapshot taken now; call
    /// again to restart against current state.
    pub fn chunk_info_iter(&self, start: Option<ChunkInfo>) -> ChunkInfoIter {
        let entries = self.shared.entries.read();
        let products = entries
            .values()
            .map(|product| product.snapshot())
            .collect::<Vec<_>>();
        ChunkInfoIter {
            products: products.into_iter(),
            current: None,
            next_index: 0,
            start,
        }
    }

    /// Persists (when configured) and stops the eviction task. Further
    /// calls are no-ops; the store remains readable.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.shared.evictor.lock().take() {
            handle.abort();
        }
        if let Some(path) = &self.shared.snapshot_path {
            self.shared.save(path)?;
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.evictor.get_mut().take() {
            handle.abort();
        }
        if let Some(path) = &self.snapshot_path {
            if let Err(err) = self.save(path) {
                tracing::warn!(path = %path.display(), error = %err, "snapshot write failed");
            }
        }
    }
}

impl Shared {
    fn save(&self, path: &Path) -> Result<()> {
        let mut enc = Encoder::new();
        {
            let entries = self.entries.read();
            enc.put_raw(SNAPSHOT_MAGIC);
            enc.put_u16(SNAPSHOT_VERSION);
            enc.put_u32(entries.len() as u32);
            for product in entries.values() {
                let (info, have) = product.snapshot();
                info.encode(&mut enc, PROTOCOL_VERSION)?;
                enc.put_u8(product.is_named() as u8);
                enc.put_u32(have.len() as u32);
                let mut packed = vec![0u8; have.len().div_ceil(8)];
                for (i, &h) in have.iter().enumerate() {
                    if h {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                enc.put_raw(&packed);
                enc.put_bytes(&product.data());
            }
        }

        // Atomic write: temp file, then rename.
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&enc.take())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), "product store snapshot written");
        Ok(())
    }

    fn restore(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let mut dec = Decoder::new(Bytes::from(bytes));

        let magic = dec.raw(SNAPSHOT_MAGIC.len())?;
        if &magic[..] != SNAPSHOT_MAGIC {
            return Err(Error::runtime("not a product store snapshot"));
        }
        let version = dec.u16()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::runtime(format!(
                "unsupported snapshot version {version}"
            )));
        }

        let count = dec.u32()?;
        let mut entries = self.entries.write();
        for _ in 0..count {
            let info = ProdInfo::decode(&mut dec, PROTOCOL_VERSION)?;
            let named = dec.u8()? != 0;
            let num_chunks = dec.u32()? as usize;
            let packed = dec.raw(num_chunks.div_ceil(8))?;
            let have = (0..num_chunks)
                .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            let data = dec.bytes()?.to_vec();
            let product = Product::from_parts(info.clone(), named, have, data)?;
            entries.insert(info.index(), product);
            self.expiry.push(info.index(), self.residence);
        }
        tracing::info!(
            path = %path.display(),
            products = entries.len(),
            "product store snapshot restored"
        );
        Ok(())
    }
}

// ── ChunkInfoIter ────────────────────────────────────────────────────────────

/// Lazy walk over the chunks present in a store snapshot.
pub struct ChunkInfoIter {
    products: std::vec::IntoIter<(ProdInfo, Vec<bool>)>,
    current: Option<(ProdInfo, Vec<bool>)>,
    next_index: usize,
    start: Option<ChunkInfo>,
}

impl Iterator for ChunkInfoIter {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<ChunkInfo> {
        loop {
            if self.current.is_none() {
                self.current = Some(self.products.next()?);
                self.next_index = 0;
            }
            let (info, have) = self.current.as_ref().expect("set above");
            while self.next_index < have.len() {
                let index = self.next_index;
                self.next_index += 1;
                if !have[index] {
                    continue;
                }
                if let Ok(chunk_info) = info.chunk_info(index as u32) {
                    if self.start.map_or(true, |start| chunk_info >= start) {
                        return Some(chunk_info);
                    }
                }
            }
            self.current = None;
        }
    }
}
