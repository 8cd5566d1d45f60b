//! Handler doubles that record what they receive.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use gatelink::{
    BackendHandler,
    BackendMessage,
    Frame,
    HandlerError,
    Handlers,
    MessageHandler,
    MetaEventHandler,
    NoticeHandler,
};
use serde_json::Value;
use tokio::sync::Notify;

/// One delivery observed by a [`Recorder`].
#[derive(Clone, Debug, PartialEq)]
pub enum Seen {
    Message(Value),
    Notice(Value),
    MetaEvent(Value),
    Backend(Value),
}

/// Records every delivery, in order, across all handler traits.
#[derive(Debug, Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Snapshot of deliveries so far.
    pub fn seen(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` deliveries were recorded.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within five seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<Seen> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                let seen = self.seen();
                if seen.len() >= count {
                    return seen;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {count} deliveries, saw {:?}", self.seen()))
    }

    /// Pipeline handlers that all feed this recorder.
    pub fn handlers(self: &Arc<Self>) -> Handlers {
        Handlers::new(
            Arc::clone(self) as Arc<dyn MessageHandler>,
            Arc::clone(self) as Arc<dyn NoticeHandler>,
            Arc::clone(self) as Arc<dyn MetaEventHandler>,
        )
    }

    fn record(&self, seen: Seen) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(seen);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_message(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(Seen::Message(frame.into_value()));
        Ok(())
    }
}

#[async_trait]
impl NoticeHandler for Recorder {
    async fn on_notice(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(Seen::Notice(frame.into_value()));
        Ok(())
    }
}

#[async_trait]
impl MetaEventHandler for Recorder {
    async fn on_meta_event(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(Seen::MetaEvent(frame.into_value()));
        Ok(())
    }
}

#[async_trait]
impl BackendHandler for Recorder {
    async fn on_backend_message(
        &self,
        _message: BackendMessage,
        payload: Value,
    ) -> Result<(), HandlerError> {
        self.record(Seen::Backend(payload));
        Ok(())
    }
}
