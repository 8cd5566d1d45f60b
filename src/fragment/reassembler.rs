//! Inbound helper that stitches fragments back into complete payloads.
//!
//! [`Reassembler`] mirrors the outbound [`ChunkCodec`](super::ChunkCodec) by
//! collecting fragments keyed by message identity. Fragments may arrive in
//! any order; a buffer completes once every index in `0..total_chunks` is
//! present. Partial buffers that never complete are purged after a fixed TTL
//! so fragment loss cannot grow memory without bound. Fragments are stored
//! sparsely and a series may never declare or buffer more than
//! `max_message_size` bytes, so a forged header cannot force a large
//! allocation.
//!
//! The buffer map is a [`DashMap`], so the receive path and the periodic
//! sweep can share one instance. Insert-if-absent and remove-on-completion
//! happen under the per-key entry lock, which keeps completion and eviction
//! from racing on the same buffer.

use std::{collections::BTreeMap, num::NonZeroUsize, time::Duration};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use log::{debug, warn};
use serde_json::Value;
use tokio::time::Instant;

use super::{ChunkEnvelope, FragmentError, codec::decode_payload};
use crate::metrics;

#[derive(Debug)]
struct ReassemblyBuffer {
    total_chunks: u32,
    fragments: BTreeMap<u32, Bytes>,
    size: usize,
    created_at: Instant,
}

impl ReassemblyBuffer {
    fn new(total_chunks: u32, created_at: Instant) -> Self {
        Self {
            total_chunks,
            fragments: BTreeMap::new(),
            size: 0,
            created_at,
        }
    }

    /// Buffered size once `fragment` lands at `index`.
    fn size_with(&self, index: u32, fragment: &Bytes) -> usize {
        let replaced = self.fragments.get(&index).map_or(0, Bytes::len);
        self.size - replaced + fragment.len()
    }

    /// Store `fragment` at `index`; a duplicate overwrites the earlier copy.
    fn insert(&mut self, index: u32, fragment: Bytes) {
        self.size = self.size_with(index, &fragment);
        self.fragments.insert(index, fragment);
    }

    fn received(&self) -> usize { self.fragments.len() }

    fn is_complete(&self) -> bool {
        u32::try_from(self.fragments.len()).is_ok_and(|received| received == self.total_chunks)
    }

    fn into_payload(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.size);
        for fragment in self.fragments.into_values() {
            payload.extend_from_slice(&fragment);
        }
        payload
    }
}

/// Shared fragment re-assembler with TTL-based eviction.
#[derive(Debug)]
pub struct Reassembler {
    max_message_size: NonZeroUsize,
    ttl: Duration,
    buffers: DashMap<String, ReassemblyBuffer>,
}

impl Reassembler {
    /// Create a re-assembler that caps each stitched payload at
    /// `max_message_size` bytes and evicts partial buffers older than `ttl`.
    #[must_use]
    pub fn new(max_message_size: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            max_message_size,
            ttl,
            buffers: DashMap::new(),
        }
    }

    /// Largest payload a series may stitch to.
    #[must_use]
    pub const fn max_message_size(&self) -> NonZeroUsize { self.max_message_size }

    /// Age after which an incomplete buffer is dropped.
    #[must_use]
    pub const fn ttl(&self) -> Duration { self.ttl }

    /// Feed a fragment, logging and dropping it if it is invalid.
    ///
    /// Returns the decoded payload once the fragment completes its message
    /// and `None` while more fragments are required or when the fragment was
    /// rejected.
    pub fn add_fragment(&self, envelope: ChunkEnvelope) -> Option<Value> {
        match self.push(envelope) {
            Ok(complete) => complete,
            Err(err) => {
                warn!("fragment dropped: error={err}");
                metrics::inc_fragments_dropped();
                None
            }
        }
    }

    /// Process a fragment using the current time.
    ///
    /// Returns `Ok(Some(_))` when the fragment completes the message and
    /// `Ok(None)` while more fragments are required.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError`] when the fragment index is out of range, when
    /// it disagrees with earlier fragments about the series length, when the
    /// series exceeds the size limit, or when the completed payload is not
    /// valid JSON. Only the offending fragment is discarded on a range or
    /// length error; an oversized series or a malformed completion discards
    /// the whole buffer.
    pub fn push(&self, envelope: ChunkEnvelope) -> Result<Option<Value>, FragmentError> {
        self.push_at(envelope, Instant::now())
    }

    /// Process a fragment using an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`push`](Self::push).
    pub fn push_at(
        &self,
        envelope: ChunkEnvelope,
        now: Instant,
    ) -> Result<Option<Value>, FragmentError> {
        let index = envelope.chunk_index();
        let total = envelope.total_chunks();
        if total == 0 {
            return Err(FragmentError::EmptySeries {
                message_id: envelope.message_id().to_owned(),
            });
        }
        if index >= total {
            return Err(FragmentError::IndexOutOfRange {
                message_id: envelope.message_id().to_owned(),
                index,
                total,
            });
        }
        let limit = self.max_message_size;
        if !usize::try_from(total).is_ok_and(|total| total <= limit.get()) {
            return Err(FragmentError::SeriesTooLarge {
                message_id: envelope.message_id().to_owned(),
                total,
                limit,
            });
        }

        let message_id = envelope.message_id().to_owned();
        let fragment = envelope.into_fragment();
        let (message_id, buffer) = match self.buffers.entry(message_id) {
            Entry::Occupied(mut occupied) => {
                let expected = occupied.get().total_chunks;
                if expected != total {
                    return Err(FragmentError::TotalMismatch {
                        message_id: occupied.key().clone(),
                        expected,
                        found: total,
                    });
                }
                let attempted = occupied.get().size_with(index, &fragment);
                if attempted > limit.get() {
                    let (message_id, _) = occupied.remove_entry();
                    return Err(FragmentError::MessageTooLarge {
                        message_id,
                        attempted,
                        limit,
                    });
                }
                let buffer = occupied.get_mut();
                buffer.insert(index, fragment);
                if !buffer.is_complete() {
                    return Ok(None);
                }
                occupied.remove_entry()
            }
            Entry::Vacant(vacant) => {
                if fragment.len() > limit.get() {
                    return Err(FragmentError::MessageTooLarge {
                        message_id: vacant.into_key(),
                        attempted: fragment.len(),
                        limit,
                    });
                }
                let mut buffer = ReassemblyBuffer::new(total, now);
                buffer.insert(index, fragment);
                if !buffer.is_complete() {
                    debug!(
                        "reassembly started: message_id={}, total_chunks={total}",
                        vacant.key()
                    );
                    vacant.insert(buffer);
                    return Ok(None);
                }
                (vacant.into_key(), buffer)
            }
        };

        debug!(
            "reassembly complete: message_id={message_id}, total_chunks={}",
            buffer.total_chunks
        );
        decode_payload(&message_id, &buffer.into_payload()).map(Some)
    }

    /// Remove partial buffers that outlived the TTL.
    ///
    /// Returns the identities of the evicted messages.
    pub fn purge_expired(&self) -> Vec<String> { self.purge_expired_at(Instant::now()) }

    /// Remove partial buffers that outlived the TTL using an explicit clock
    /// reading.
    pub fn purge_expired_at(&self, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();
        let ttl = self.ttl;

        self.buffers.retain(|message_id, buffer| {
            let expired = now.saturating_duration_since(buffer.created_at) >= ttl;
            if expired {
                warn!(
                    "incomplete reassembly expired: message_id={message_id}, received={}/{}",
                    buffer.received(),
                    buffer.total_chunks
                );
                evicted.push(message_id.clone());
            }
            !expired
        });

        metrics::inc_reassembly_evictions(evicted.len());
        evicted
    }

    /// Number of partial messages currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize { self.buffers.len() }
}
