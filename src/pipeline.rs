//! Bounded dispatch queue between the gateway receive path and handlers.
//!
//! The gateway classifies each complete event frame and enqueues it here. A
//! single consumer ([`MessagePipeline::run`]) pulls frames in enqueue order and
//! hands each to exactly one of the three handler collaborators selected by
//! the frame's discriminator. Handler errors and panics are logged and the
//! loop moves on.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    select,
    sync::{Mutex, mpsc},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::PipelineConfig,
    frame::{Frame, FrameKind},
    metrics,
    panic::report_panic,
};

/// Error type returned by handler collaborators.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives `message` frames.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one chat message event.
    async fn on_message(&self, frame: Frame) -> Result<(), HandlerError>;
}

/// Receives `notice` frames.
#[async_trait]
pub trait NoticeHandler: Send + Sync {
    /// Handle one notice event.
    async fn on_notice(&self, frame: Frame) -> Result<(), HandlerError>;
}

/// Receives `meta_event` frames.
#[async_trait]
pub trait MetaEventHandler: Send + Sync {
    /// Handle one meta event.
    async fn on_meta_event(&self, frame: Frame) -> Result<(), HandlerError>;
}

/// The three collaborators frames are dispatched to.
#[derive(Clone)]
pub struct Handlers {
    message: Arc<dyn MessageHandler>,
    notice: Arc<dyn NoticeHandler>,
    meta_event: Arc<dyn MetaEventHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new(
        message: Arc<dyn MessageHandler>,
        notice: Arc<dyn NoticeHandler>,
        meta_event: Arc<dyn MetaEventHandler>,
    ) -> Self {
        Self {
            message,
            notice,
            meta_event,
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Errors returned when enqueueing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The consumer stopped and the queue no longer accepts frames.
    #[error("message pipeline is closed")]
    Closed,
}

/// Bounded single-consumer dispatch queue.
#[derive(Debug)]
pub struct MessagePipeline {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    pending: AtomicUsize,
    poll_timeout: Duration,
    yield_interval: Duration,
}

impl MessagePipeline {
    /// Create a pipeline from its configuration section.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.max(1)),
            yield_interval: Duration::from_millis(config.yield_ms),
        }
    }

    /// Queue `frame` for dispatch, waiting for space when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Closed`] after the consumer has shut down.
    pub async fn enqueue(&self, frame: Frame) -> Result<(), PipelineError> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(frame).await.is_err() {
            self.mark_done();
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    /// Frames enqueued but not yet marked done.
    #[must_use]
    pub fn pending(&self) -> usize { self.pending.load(Ordering::Acquire) }

    /// Consume frames until `shutdown` is cancelled, then drain.
    ///
    /// Only one consumer runs at a time; a second call waits for the first to
    /// finish.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run(&self, handlers: &Handlers, shutdown: &CancellationToken) {
        let mut rx = self.rx.lock().await;
        loop {
            let polled = select! {
                biased;

                () = shutdown.cancelled() => break,
                polled = timeout(self.poll_timeout, rx.recv()) => polled,
            };
            match polled {
                Err(_) => {}
                Ok(None) => break,
                Ok(Some(frame)) => {
                    dispatch(handlers, frame).await;
                    self.mark_done();
                    if !self.yield_interval.is_zero() {
                        sleep(self.yield_interval).await;
                    }
                }
            }
        }
        let drained = self.drain_locked(&mut rx);
        debug!("message pipeline stopped: drained={drained}");
    }

    /// Close the queue and discard anything still in it, marking each item
    /// done.
    ///
    /// Returns the number of frames discarded.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        self.drain_locked(&mut rx)
    }

    fn drain_locked(&self, rx: &mut mpsc::Receiver<Frame>) -> usize {
        rx.close();
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            self.mark_done();
            drained += 1;
        }
        if drained > 0 {
            warn!("queued frames discarded at shutdown: count={drained}");
        }
        drained
    }

    fn mark_done(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

async fn dispatch(handlers: &Handlers, frame: Frame) {
    let kind = frame.kind();
    let fut = match kind {
        FrameKind::Message => handlers.message.on_message(frame),
        FrameKind::Notice => handlers.notice.on_notice(frame),
        FrameKind::MetaEvent => handlers.meta_event.on_meta_event(frame),
        FrameKind::Reply | FrameKind::Unknown(_) => {
            warn!("frame dropped: reason=no handler, kind={kind}");
            return;
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics::inc_errors();
            warn!("handler failed: kind={kind}, error={e}");
        }
        Err(panic) => {
            report_panic("handler panicked", &format!("kind={kind}"), panic.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use super::*;
    use crate::test_helpers::{Failing, Panicking, Recorder, frame, handlers_for};

    fn config() -> PipelineConfig {
        PipelineConfig {
            capacity: 8,
            poll_timeout_ms: 10,
            yield_ms: 0,
        }
    }

    async fn run_until_idle(pipeline: &Arc<MessagePipeline>, handlers: Handlers) {
        let token = CancellationToken::new();
        let task = {
            let pipeline = Arc::clone(pipeline);
            let token = token.clone();
            tokio::spawn(async move { pipeline.run(&handlers, &token).await })
        };
        while pipeline.pending() > 0 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        task.await.expect("pipeline task");
    }

    #[tokio::test]
    async fn frames_reach_handler_for_their_kind_in_order() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = Arc::new(MessagePipeline::new(&config()));
        for (kind, n) in [("message", 1), ("notice", 2), ("meta_event", 3), ("message", 4)] {
            pipeline
                .enqueue(frame(json!({"post_type": kind, "n": n})))
                .await
                .expect("enqueue");
        }

        run_until_idle(&pipeline, handlers_for(&recorder)).await;

        assert_eq!(
            recorder.seen(),
            vec![
                ("message".to_owned(), 1),
                ("notice".to_owned(), 2),
                ("meta_event".to_owned(), 3),
                ("message".to_owned(), 4),
            ]
        );
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_and_panicking_handlers_do_not_stall_queue() {
        let recorder = Arc::new(Recorder::default());
        let handlers = Handlers::new(
            Arc::new(Failing),
            Arc::new(Panicking),
            Arc::clone(&recorder) as Arc<dyn MetaEventHandler>,
        );
        let pipeline = Arc::new(MessagePipeline::new(&config()));
        for kind in ["message", "notice", "meta_event"] {
            pipeline
                .enqueue(frame(json!({"post_type": kind, "n": 9})))
                .await
                .expect("enqueue");
        }

        run_until_idle(&pipeline, handlers).await;

        assert_eq!(recorder.seen(), vec![("meta_event".to_owned(), 9)]);
        assert!(logs_contain("handler panicked"));
    }

    #[tokio::test]
    async fn cancellation_drains_remaining_frames() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = MessagePipeline::new(&config());
        for n in 0..5 {
            pipeline
                .enqueue(frame(json!({"post_type": "message", "n": n})))
                .await
                .expect("enqueue");
        }
        let token = CancellationToken::new();
        token.cancel();

        pipeline.run(&handlers_for(&recorder), &token).await;

        assert!(recorder.seen().is_empty());
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(
            pipeline.enqueue(frame(json!({"post_type": "message"}))).await,
            Err(PipelineError::Closed)
        );
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    async fn explicit_drain_empties_queue() {
        let pipeline = MessagePipeline::new(&config());
        pipeline
            .enqueue(frame(json!({"post_type": "notice"})))
            .await
            .expect("enqueue");
        assert_eq!(pipeline.pending(), 1);
        assert_eq!(pipeline.drain().await, 1);
        assert_eq!(pipeline.pending(), 0);
    }
}
