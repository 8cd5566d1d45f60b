//! Error types emitted by the chunking and reassembly layer.
//!
//! A failing fragment never poisons the pipeline: the reassembler drops the
//! offending unit, logs the error, and keeps going.

use std::num::NonZeroUsize;

use thiserror::Error;

/// Errors produced while splitting, decoding, or stitching chunk fragments.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// The frame does not carry the chunk tags.
    #[error("frame is not a chunk fragment")]
    NotAFragment,
    /// The chunk header could not be decoded.
    #[error("malformed chunk header: {0}")]
    Header(#[source] serde_json::Error),
    /// The chunk data was not valid base64.
    #[error("chunk data is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    /// A fragment declared a series with no chunks.
    #[error("message {message_id} declares zero chunks")]
    EmptySeries { message_id: String },
    /// A fragment index fell outside `0..total_chunks`.
    #[error("chunk index {index} out of range for {total} chunks (message {message_id})")]
    IndexOutOfRange {
        message_id: String,
        index: u32,
        total: u32,
    },
    /// A fragment declared more chunks than the size limit can hold.
    #[error("message {message_id} declares {total} chunks, exceeding the {limit}-byte limit")]
    SeriesTooLarge {
        message_id: String,
        total: u32,
        limit: NonZeroUsize,
    },
    /// Buffered fragments would exceed the reassembly size limit.
    #[error("message {message_id} would reach {attempted} bytes, exceeding the {limit}-byte limit")]
    MessageTooLarge {
        message_id: String,
        attempted: usize,
        limit: NonZeroUsize,
    },
    /// A fragment disagreed with its siblings about the series length.
    #[error("message {message_id} expects {expected} chunks but fragment declares {found}")]
    TotalMismatch {
        message_id: String,
        expected: u32,
        found: u32,
    },
    /// Fragments passed together belong to different messages.
    #[error("fragment set mixes messages {expected} and {found}")]
    MessageMismatch { expected: String, found: String },
    /// Reassembly was requested before every index arrived.
    #[error("message {message_id} is incomplete: {received}/{total} chunks")]
    Incomplete {
        message_id: String,
        received: usize,
        total: u32,
    },
    /// The payload needs more fragments than a `u32` index can address.
    #[error("payload requires {required} fragments, exceeding the chunk index range")]
    TooManyFragments { required: usize },
    /// The stitched payload is not a valid JSON document.
    #[error("reassembled payload for {message_id} is malformed: {source}")]
    Malformed {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },
}
