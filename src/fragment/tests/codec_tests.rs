//! Tests for outbound splitting and one-shot reassembly.

use std::num::NonZeroUsize;

use proptest::prelude::*;
use rstest::rstest;
use serde_json::json;

use crate::fragment::{ChunkCodec, ChunkEnvelope, FragmentError, reassemble, reassemble_bytes};

const KIB: usize = 1024;

fn codec(max: usize) -> ChunkCodec { ChunkCodec::new(NonZeroUsize::new(max).expect("non-zero")) }

#[test]
fn codec_splits_payload_into_indexed_fragments() {
    let payload: Vec<u8> = (0..8).collect();
    let fragments = codec(3).fragment(payload).expect("fragment payload");

    assert_eq!(fragments.len(), 3);
    let id = fragments[0].message_id().to_owned();
    for (expected_index, fragment) in (0u32..).zip(&fragments) {
        assert_eq!(fragment.message_id(), id);
        assert_eq!(fragment.chunk_index(), expected_index);
        assert_eq!(fragment.total_chunks(), 3);
    }
    assert_eq!(fragments[0].fragment().as_ref(), &[0, 1, 2]);
    assert_eq!(fragments[1].fragment().as_ref(), &[3, 4, 5]);
    assert_eq!(fragments[2].fragment().as_ref(), &[6, 7]);
}

#[test]
fn codec_generates_fresh_identity_per_payload() {
    let codec = codec(4);
    let first = codec.fragment(vec![1_u8; 10]).expect("first split");
    let second = codec.fragment(vec![1_u8; 10]).expect("second split");
    assert_ne!(first[0].message_id(), second[0].message_id());
}

#[test]
fn codec_emits_single_empty_fragment_for_empty_payload() {
    let fragments = codec(8).fragment(Vec::new()).expect("fragment empty");
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].total_chunks(), 1);
    assert!(fragments[0].fragment().is_empty());
}

#[rstest]
#[case(10, 10, false)]
#[case(11, 10, true)]
#[case(0, 1, false)]
fn should_fragment_only_above_limit(#[case] len: usize, #[case] max: usize, #[case] expected: bool) {
    assert_eq!(codec(max).should_fragment(&vec![0_u8; len]), expected);
}

#[test]
fn reassembles_300_kib_payload_received_out_of_order() {
    let payload: Vec<u8> = (0..300 * KIB).map(|i| (i % 251) as u8).collect();
    let fragments = codec(60 * KIB)
        .fragment(payload.clone())
        .expect("fragment payload");

    assert_eq!(fragments.len(), 5);
    let indices: Vec<u32> = fragments.iter().map(ChunkEnvelope::chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    let shuffled: Vec<ChunkEnvelope> = [2, 0, 4, 1, 3]
        .into_iter()
        .map(|i: usize| fragments[i].clone())
        .collect();
    let restored = reassemble_bytes(&shuffled).expect("reassemble");
    assert_eq!(restored.len(), 300 * KIB);
    assert_eq!(restored, payload);
}

#[test]
fn reassemble_decodes_json_payload() {
    let value = json!({"post_type": "message", "raw_message": "x".repeat(500)});
    let bytes = serde_json::to_vec(&value).expect("serialize");
    let mut fragments = codec(64).fragment(bytes).expect("fragment");
    fragments.reverse();

    assert_eq!(reassemble(&fragments).expect("reassemble"), value);
}

#[test]
fn duplicate_fragment_does_not_corrupt_payload() {
    let payload = b"{\"a\":\"0123456789\"}".to_vec();
    let mut fragments = codec(4).fragment(payload.clone()).expect("fragment");
    fragments.push(fragments[1].clone());

    assert_eq!(reassemble_bytes(&fragments).expect("reassemble"), payload);
}

#[test]
fn reassemble_reports_missing_index() {
    let mut fragments = codec(2).fragment(vec![7_u8; 6]).expect("fragment");
    fragments.remove(1);

    let err = reassemble_bytes(&fragments).expect_err("set is incomplete");
    assert!(matches!(
        err,
        FragmentError::Incomplete {
            received: 2,
            total: 3,
            ..
        }
    ));
}

#[test]
fn reassemble_rejects_mixed_messages() {
    let codec = codec(2);
    let mut fragments = codec.fragment(vec![1_u8; 4]).expect("first");
    fragments.extend(codec.fragment(vec![2_u8; 4]).expect("second"));

    assert!(matches!(
        reassemble_bytes(&fragments),
        Err(FragmentError::MessageMismatch { .. })
    ));
}

#[test]
fn reassemble_rejects_out_of_range_index() {
    let fragments = vec![
        ChunkEnvelope::new("m", 0, 2, vec![1_u8]),
        ChunkEnvelope::new("m", 2, 2, vec![2_u8]),
    ];
    assert!(matches!(
        reassemble_bytes(&fragments),
        Err(FragmentError::IndexOutOfRange { index: 2, total: 2, .. })
    ));
}

#[test]
fn reassemble_flags_malformed_json() {
    let fragments = codec(3).fragment(b"{not json".to_vec()).expect("fragment");
    assert!(matches!(
        reassemble(&fragments),
        Err(FragmentError::Malformed { .. })
    ));
}

fn split_case() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
    (prop::collection::vec(any::<u8>(), 0..4096), 1usize..512).prop_flat_map(|(payload, max)| {
        let count = payload.len().div_ceil(max).max(1);
        let order = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
        (Just(payload), Just(max), order)
    })
}

proptest! {
    #[test]
    fn fragments_reassemble_in_any_order((payload, max, order) in split_case()) {
        let fragments = codec(max).fragment(payload.clone()).expect("fragment");

        prop_assert_eq!(fragments.len(), payload.len().div_ceil(max).max(1));
        prop_assert!(fragments.iter().all(|f| f.fragment().len() <= max));

        let shuffled: Vec<ChunkEnvelope> = order.iter().map(|&i| fragments[i].clone()).collect();
        prop_assert_eq!(reassemble_bytes(&shuffled).expect("reassemble"), payload);
    }
}

#[test]
fn reassemble_handles_forged_series_length() {
    let fragments = vec![ChunkEnvelope::new("m", 0, u32::MAX, vec![1_u8])];
    assert!(matches!(
        reassemble_bytes(&fragments),
        Err(FragmentError::Incomplete {
            received: 1,
            total: u32::MAX,
            ..
        })
    ));
}
