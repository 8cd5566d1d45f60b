//! Pure splitting and stitching of oversized payloads.
//!
//! [`ChunkCodec`] cuts a serialized payload into fixed-size fragments that
//! share a freshly generated message identity. [`reassemble`] and
//! [`reassemble_bytes`] reverse the split from a complete fragment set in any
//! arrival order. None of these functions hold state.

use std::{collections::BTreeMap, num::NonZeroUsize};

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use super::{ChunkEnvelope, FragmentError};

/// Splits serialized payloads into [`ChunkEnvelope`]s no larger than a limit.
#[derive(Clone, Copy, Debug)]
pub struct ChunkCodec {
    max_fragment_size: NonZeroUsize,
}

impl ChunkCodec {
    /// Create a codec that caps fragment payloads at `max_fragment_size` bytes.
    #[must_use]
    pub const fn new(max_fragment_size: NonZeroUsize) -> Self { Self { max_fragment_size } }

    /// Return the maximum fragment payload size in bytes.
    #[must_use]
    pub const fn max_fragment_size(&self) -> NonZeroUsize { self.max_fragment_size }

    /// Whether `payload` exceeds the fragment size limit.
    #[must_use]
    pub fn should_fragment(&self, payload: &[u8]) -> bool {
        payload.len() > self.max_fragment_size.get()
    }

    /// Split `payload` under a newly generated message identity.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::TooManyFragments`] if the split would need
    /// more fragments than a `u32` index can address.
    pub fn fragment(&self, payload: impl Into<Bytes>) -> Result<Vec<ChunkEnvelope>, FragmentError> {
        self.fragment_with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Split `payload`, tagging every fragment with `message_id`.
    ///
    /// The split is deterministic: fragment `i` covers bytes
    /// `i * max..min((i + 1) * max, len)`. An empty payload yields a single
    /// empty fragment so the receiver still observes a complete series.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::TooManyFragments`] if the split would need
    /// more fragments than a `u32` index can address.
    pub fn fragment_with_id(
        &self,
        message_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Vec<ChunkEnvelope>, FragmentError> {
        let message_id = message_id.into();
        let payload = payload.into();
        let max = self.max_fragment_size.get();
        let required = payload.len().div_ceil(max).max(1);
        let total = u32::try_from(required)
            .map_err(|_| FragmentError::TooManyFragments { required })?;

        let fragments = (0..total)
            .zip((0..required).map(|slot| slot * max))
            .map(|(index, start)| {
                let end = (start + max).min(payload.len());
                ChunkEnvelope::new(
                    message_id.clone(),
                    index,
                    total,
                    payload.slice(start..end),
                )
            })
            .collect();
        Ok(fragments)
    }
}

/// Stitch a complete fragment set back into the original bytes.
///
/// Fragments may be supplied in any order. A duplicate of an index replaces
/// the earlier copy. Slots are only allocated for fragments actually
/// supplied, so the declared series length never drives an allocation.
///
/// # Errors
///
/// Returns [`FragmentError`] when the set is empty, mixes messages, disagrees
/// on the series length, carries an out-of-range index, or misses an index.
pub fn reassemble_bytes(fragments: &[ChunkEnvelope]) -> Result<Vec<u8>, FragmentError> {
    let Some(first) = fragments.first() else {
        return Err(FragmentError::Incomplete {
            message_id: String::new(),
            received: 0,
            total: 0,
        });
    };
    let message_id = first.message_id();
    let total = first.total_chunks();
    if total == 0 {
        return Err(FragmentError::EmptySeries {
            message_id: message_id.to_owned(),
        });
    }

    let mut slots: BTreeMap<u32, &Bytes> = BTreeMap::new();
    for envelope in fragments {
        if envelope.message_id() != message_id {
            return Err(FragmentError::MessageMismatch {
                expected: message_id.to_owned(),
                found: envelope.message_id().to_owned(),
            });
        }
        if envelope.total_chunks() != total {
            return Err(FragmentError::TotalMismatch {
                message_id: message_id.to_owned(),
                expected: total,
                found: envelope.total_chunks(),
            });
        }
        if envelope.chunk_index() >= total {
            return Err(FragmentError::IndexOutOfRange {
                message_id: message_id.to_owned(),
                index: envelope.chunk_index(),
                total,
            });
        }
        slots.insert(envelope.chunk_index(), envelope.fragment());
    }

    let received = slots.len();
    if !u32::try_from(received).is_ok_and(|received| received >= total) {
        return Err(FragmentError::Incomplete {
            message_id: message_id.to_owned(),
            received,
            total,
        });
    }

    let size = slots.values().map(|bytes| bytes.len()).sum();
    let mut payload = Vec::with_capacity(size);
    for bytes in slots.into_values() {
        payload.extend_from_slice(bytes);
    }
    Ok(payload)
}

/// Stitch a complete fragment set and decode the result as JSON.
///
/// # Errors
///
/// Returns the errors of [`reassemble_bytes`], or
/// [`FragmentError::Malformed`] when the stitched bytes are not valid JSON.
pub fn reassemble(fragments: &[ChunkEnvelope]) -> Result<Value, FragmentError> {
    let payload = reassemble_bytes(fragments)?;
    decode_payload(fragments.first().map_or("", ChunkEnvelope::message_id), &payload)
}

pub(super) fn decode_payload(message_id: &str, payload: &[u8]) -> Result<Value, FragmentError> {
    serde_json::from_slice(payload).map_err(|source| FragmentError::Malformed {
        message_id: message_id.to_owned(),
        source,
    })
}
