//! Tests for the tagged fragment wire format.

use serde_json::json;

use crate::fragment::{CHUNK_DATA_KEY, CHUNK_INFO_KEY, ChunkEnvelope, FragmentError, is_fragment};

#[test]
fn envelope_survives_wire_encoding() {
    let envelope = ChunkEnvelope::new("abc", 1, 3, vec![0_u8, 159, 146, 150]);
    let decoded = ChunkEnvelope::from_value(&envelope.to_value()).expect("decode envelope");
    assert_eq!(decoded, envelope);
}

#[test]
fn ordinary_frames_are_not_fragments() {
    assert!(!is_fragment(&json!({"post_type": "message"})));
    assert!(!is_fragment(&json!({CHUNK_INFO_KEY: {}})));
    assert!(!is_fragment(&json!([1, 2, 3])));
    assert!(!is_fragment(&json!({CHUNK_INFO_KEY: "x", CHUNK_DATA_KEY: "AA=="})));
}

#[test]
fn tagged_frames_are_fragments() {
    let frame = ChunkEnvelope::new("abc", 0, 1, Vec::new()).to_value();
    assert!(is_fragment(&frame));
}

#[test]
fn malformed_header_is_reported() {
    let frame = json!({
        CHUNK_INFO_KEY: {"message_id": "abc", "chunk_index": "zero"},
        CHUNK_DATA_KEY: "",
    });
    assert!(matches!(
        ChunkEnvelope::from_value(&frame),
        Err(FragmentError::Header(_))
    ));
}

#[test]
fn invalid_base64_is_reported() {
    let frame = json!({
        CHUNK_INFO_KEY: {"message_id": "abc", "chunk_index": 0, "total_chunks": 1},
        CHUNK_DATA_KEY: "***",
    });
    assert!(matches!(
        ChunkEnvelope::from_value(&frame),
        Err(FragmentError::Encoding(_))
    ));
}

#[test]
fn untagged_frame_is_not_decoded() {
    assert!(matches!(
        ChunkEnvelope::from_value(&json!({"echo": "1"})),
        Err(FragmentError::NotAFragment)
    ));
}
