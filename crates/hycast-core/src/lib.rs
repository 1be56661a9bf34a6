//! hycast-core — shared types, wire codec, and configuration.
//! All other Hycast crates depend on this one.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod prod;
pub mod wire;

pub use chunk::{ActualChunk, LatentChunk};
pub use codec::{Decoder, Encoder, Serial};
pub use error::{Error, Result};
pub use prod::{
    canon_chunk_size, set_canon_chunk_size, ChunkIndex, ChunkInfo, ChunkSize, ProdIndex, ProdInfo,
    ProdSize,
};
