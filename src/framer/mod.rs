//! Chunking and reassembly of opaque message buffers.

mod chunk;
mod unchunker;

pub use chunk::{Chunk, Chunker, length_prefixed, strip_length_prefix};
pub use unchunker::{ChunkCollector, Unchunker};
