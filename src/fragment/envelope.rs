//! Wire representation of a single chunk fragment.
//!
//! Fragments travel as ordinary JSON objects tagged with two reserved keys so
//! they can never be mistaken for gateway events:
//!
//! ```json
//! {
//!   "__chunk_info__": { "message_id": "…", "chunk_index": 0, "total_chunks": 5 },
//!   "__chunk_data__": "<base64 fragment bytes>"
//! }
//! ```

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::FragmentError;

/// Key holding the chunk header object.
pub const CHUNK_INFO_KEY: &str = "__chunk_info__";
/// Key holding the base64-encoded fragment bytes.
pub const CHUNK_DATA_KEY: &str = "__chunk_data__";

#[derive(Debug, Deserialize)]
struct ChunkInfo {
    message_id: String,
    chunk_index: u32,
    total_chunks: u32,
}

/// One ordered piece of a payload that exceeded the transport size limit.
///
/// Construction does not validate `chunk_index < total_chunks`; the
/// [`Reassembler`](super::Reassembler) and [`reassemble`](super::reassemble)
/// reject inconsistent envelopes so a bad peer cannot crash the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkEnvelope {
    message_id: String,
    chunk_index: u32,
    total_chunks: u32,
    fragment: Bytes,
}

impl ChunkEnvelope {
    /// Build an envelope from its parts.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        chunk_index: u32,
        total_chunks: u32,
        fragment: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            chunk_index,
            total_chunks,
            fragment: fragment.into(),
        }
    }

    /// Identity shared by every fragment of the same payload.
    #[must_use]
    pub fn message_id(&self) -> &str { &self.message_id }

    /// Zero-based position of this fragment.
    #[must_use]
    pub const fn chunk_index(&self) -> u32 { self.chunk_index }

    /// Number of fragments in the series.
    #[must_use]
    pub const fn total_chunks(&self) -> u32 { self.total_chunks }

    /// Borrow the fragment bytes.
    #[must_use]
    pub fn fragment(&self) -> &Bytes { &self.fragment }

    /// Consume the envelope, returning the fragment bytes.
    #[must_use]
    pub fn into_fragment(self) -> Bytes { self.fragment }

    /// Encode the envelope in its tagged JSON wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(2);
        object.insert(
            CHUNK_INFO_KEY.to_owned(),
            serde_json::json!({
                "message_id": self.message_id,
                "chunk_index": self.chunk_index,
                "total_chunks": self.total_chunks,
            }),
        );
        object.insert(
            CHUNK_DATA_KEY.to_owned(),
            Value::String(STANDARD.encode(&self.fragment)),
        );
        Value::Object(object)
    }

    /// Decode an envelope from its tagged JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::NotAFragment`] when the tags are missing,
    /// [`FragmentError::Header`] when the header is malformed, and
    /// [`FragmentError::Encoding`] when the data is not valid base64.
    pub fn from_value(value: &Value) -> Result<Self, FragmentError> {
        if !is_fragment(value) {
            return Err(FragmentError::NotAFragment);
        }
        let (Some(info), Some(Value::String(data))) =
            (value.get(CHUNK_INFO_KEY), value.get(CHUNK_DATA_KEY))
        else {
            return Err(FragmentError::NotAFragment);
        };
        let info: ChunkInfo =
            serde_json::from_value(info.clone()).map_err(FragmentError::Header)?;
        let fragment = STANDARD.decode(data)?;
        Ok(Self::new(
            info.message_id,
            info.chunk_index,
            info.total_chunks,
            fragment,
        ))
    }
}

/// Return `true` when `frame` carries the chunk fragment tags.
///
/// Detection is structural only; the header is validated on decode.
#[must_use]
pub fn is_fragment(frame: &Value) -> bool {
    frame.as_object().is_some_and(|object| {
        object.get(CHUNK_INFO_KEY).is_some_and(Value::is_object)
            && object.get(CHUNK_DATA_KEY).is_some_and(Value::is_string)
    })
}
