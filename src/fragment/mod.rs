//! Chunking and re-assembly of oversized payloads.
//!
//! Payloads larger than the transport limit are split by [`ChunkCodec`] into
//! tagged [`ChunkEnvelope`]s and stitched back together on receipt, either in
//! one shot with [`reassemble`] or incrementally through the shared
//! [`Reassembler`].

pub mod codec;
pub mod envelope;
pub mod error;
pub mod reassembler;

pub use codec::{ChunkCodec, reassemble, reassemble_bytes};
pub use envelope::{CHUNK_DATA_KEY, CHUNK_INFO_KEY, ChunkEnvelope, is_fragment};
pub use error::FragmentError;
pub use reassembler::Reassembler;
