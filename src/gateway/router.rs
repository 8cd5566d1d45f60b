//! Classification of inbound gateway frames.
//!
//! Each raw frame is decoded, passed through the reassembler when it is a
//! chunk fragment, and then routed by discriminator: event frames go to the
//! [`MessagePipeline`], replies go to the [`ResponseCorrelator`]. Frames are
//! routed in the order they are handed in.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use crate::{
    correlation::ResponseCorrelator,
    error::ProtocolError,
    fragment::{ChunkEnvelope, Reassembler, is_fragment},
    frame::{Frame, FrameKind},
    metrics,
    pipeline::MessagePipeline,
};

/// What happened to one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    /// An event frame was queued for dispatch.
    Enqueued {
        kind: FrameKind,
        /// The frame was a `meta_event` heartbeat.
        heartbeat: bool,
    },
    /// A reply completed a pending call.
    Resolved,
    /// A reply matched no pending call and was discarded.
    Unsolicited,
    /// A fragment was buffered; more are needed.
    AwaitingFragments,
    /// The frame was malformed or unroutable and was discarded.
    Dropped,
}

impl Routed {
    /// Whether the routed frame was a gateway heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self,
            Routed::Enqueued {
                heartbeat: true,
                ..
            }
        )
    }
}

/// Routes decoded frames to the pipeline or the correlator.
#[derive(Debug, Clone)]
pub struct InboundRouter {
    reassembler: Arc<Reassembler>,
    correlator: ResponseCorrelator<Frame>,
    pipeline: Arc<MessagePipeline>,
}

impl InboundRouter {
    #[must_use]
    pub fn new(
        reassembler: Arc<Reassembler>,
        correlator: ResponseCorrelator<Frame>,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        Self {
            reassembler,
            correlator,
            pipeline,
        }
    }

    /// Decode and route one text frame.
    pub async fn route_text(&self, raw: &str) -> Routed {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.route_value(value).await,
            Err(e) => drop_malformed(&ProtocolError::from(e)),
        }
    }

    /// Route one decoded JSON document.
    pub async fn route_value(&self, value: Value) -> Routed {
        let value = if is_fragment(&value) {
            let envelope = match ChunkEnvelope::from_value(&value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    metrics::inc_fragments_dropped();
                    return drop_malformed(&ProtocolError::from(e));
                }
            };
            match self.reassembler.add_fragment(envelope) {
                Some(complete) => complete,
                None => return Routed::AwaitingFragments,
            }
        } else {
            value
        };

        let frame = match Frame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => return drop_malformed(&e),
        };
        match frame.kind() {
            FrameKind::Reply => {
                if self.correlator.resolve(frame) {
                    Routed::Resolved
                } else {
                    Routed::Unsolicited
                }
            }
            FrameKind::Unknown(post_type) => {
                warn!("gateway frame dropped: reason=unknown post_type, post_type={post_type}");
                Routed::Dropped
            }
            kind => {
                let heartbeat = frame.is_heartbeat();
                match self.pipeline.enqueue(frame).await {
                    Ok(()) => {
                        debug!("gateway frame queued: kind={kind}");
                        Routed::Enqueued { kind, heartbeat }
                    }
                    Err(e) => {
                        warn!("gateway frame dropped: kind={kind}, error={e}");
                        Routed::Dropped
                    }
                }
            }
        }
    }
}

fn drop_malformed(err: &ProtocolError) -> Routed {
    metrics::inc_errors();
    warn!("gateway frame dropped: error={err}");
    Routed::Dropped
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, sync::Arc, time::Duration};

    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::{
        config::{ChunkingConfig, PipelineConfig},
        fragment::ChunkCodec,
        metrics::Side,
    };

    struct Harness {
        router: InboundRouter,
        correlator: ResponseCorrelator<Frame>,
        pipeline: Arc<MessagePipeline>,
    }

    #[fixture]
    fn harness() -> Harness {
        let correlator = ResponseCorrelator::new(Side::Gateway);
        let pipeline = Arc::new(MessagePipeline::new(&PipelineConfig::default()));
        let router = InboundRouter::new(
            Arc::new(Reassembler::new(
                ChunkingConfig::default().max_message_size(),
                Duration::from_secs(120),
            )),
            correlator.clone(),
            Arc::clone(&pipeline),
        );
        Harness {
            router,
            correlator,
            pipeline,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn event_frames_are_enqueued(harness: Harness) {
        let routed = harness
            .router
            .route_text(r#"{"post_type":"message","message":"hi"}"#)
            .await;
        assert_eq!(
            routed,
            Routed::Enqueued {
                kind: FrameKind::Message,
                heartbeat: false
            }
        );
        assert_eq!(harness.pipeline.pending(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn heartbeats_are_flagged(harness: Harness) {
        let routed = harness
            .router
            .route_value(json!({"post_type": "meta_event", "meta_event_type": "heartbeat"}))
            .await;
        assert_eq!(
            routed,
            Routed::Enqueued {
                kind: FrameKind::MetaEvent,
                heartbeat: true
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn replies_resolve_pending_calls(harness: Harness) {
        let waiter = harness
            .correlator
            .register("7", Duration::from_secs(30))
            .expect("register");
        let routed = harness
            .router
            .route_value(json!({"status": "ok", "retcode": 0, "echo": "7"}))
            .await;
        assert_eq!(routed, Routed::Resolved);
        assert_eq!(waiter.wait().await.expect("reply").echo().as_deref(), Some("7"));
        assert_eq!(harness.pipeline.pending(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn unmatched_replies_are_discarded(harness: Harness) {
        let routed = harness.router.route_value(json!({"echo": "nobody"})).await;
        assert_eq!(routed, Routed::Unsolicited);
    }

    #[rstest]
    #[case("{broken")]
    #[case("[1,2]")]
    #[case(r#"{"post_type":"request"}"#)]
    #[tokio::test]
    async fn malformed_or_unknown_frames_are_dropped(harness: Harness, #[case] raw: &str) {
        assert_eq!(harness.router.route_text(raw).await, Routed::Dropped);
        assert_eq!(harness.pipeline.pending(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn fragmented_frame_is_routed_once_complete(harness: Harness) {
        let event = json!({"post_type": "notice", "notice_type": "group_upload", "pad": "p".repeat(300)});
        let fragments = ChunkCodec::new(NonZeroUsize::new(100).expect("non-zero"))
            .fragment(serde_json::to_vec(&event).expect("serialize"))
            .expect("fragment");
        let (last, rest) = fragments.split_last().expect("fragments");

        for fragment in rest {
            assert_eq!(
                harness.router.route_value(fragment.to_value()).await,
                Routed::AwaitingFragments
            );
        }
        assert_eq!(
            harness.router.route_value(last.to_value()).await,
            Routed::Enqueued {
                kind: FrameKind::Notice,
                heartbeat: false
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn corrupt_fragment_is_dropped(harness: Harness) {
        let corrupt = json!({
            "__chunk_info__": {"message_id": "m", "chunk_index": 0, "total_chunks": 2},
            "__chunk_data__": "%%%",
        });
        assert_eq!(harness.router.route_value(corrupt).await, Routed::Dropped);
    }
}
