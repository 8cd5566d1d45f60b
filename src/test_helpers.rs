#![cfg(test)]
//! Handler doubles and frame builders shared by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    frame::Frame,
    pipeline::{HandlerError, Handlers, MessageHandler, MetaEventHandler, NoticeHandler},
};

/// Build a frame from a JSON object literal.
pub fn frame(value: Value) -> Frame { Frame::from_value(value).expect("frame must be an object") }

/// Records `(post_type, n)` for every frame it receives.
#[derive(Debug, Default)]
pub struct Recorder {
    seen: Mutex<Vec<(String, i64)>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<(String, i64)> { self.seen.lock().expect("recorder lock").clone() }

    fn record(&self, frame: &Frame) {
        let kind = frame.kind().to_string();
        let n = frame.get("n").and_then(Value::as_i64).unwrap_or(-1);
        self.seen.lock().expect("recorder lock").push((kind, n));
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_message(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(&frame);
        Ok(())
    }
}

#[async_trait]
impl NoticeHandler for Recorder {
    async fn on_notice(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(&frame);
        Ok(())
    }
}

#[async_trait]
impl MetaEventHandler for Recorder {
    async fn on_meta_event(&self, frame: Frame) -> Result<(), HandlerError> {
        self.record(&frame);
        Ok(())
    }
}

/// Route every kind to the same recorder.
pub fn handlers_for(recorder: &Arc<Recorder>) -> Handlers {
    Handlers::new(
        Arc::clone(recorder) as Arc<dyn MessageHandler>,
        Arc::clone(recorder) as Arc<dyn NoticeHandler>,
        Arc::clone(recorder) as Arc<dyn MetaEventHandler>,
    )
}

/// Handler that always returns an error.
#[derive(Debug)]
pub struct Failing;

#[async_trait]
impl MessageHandler for Failing {
    async fn on_message(&self, _frame: Frame) -> Result<(), HandlerError> {
        Err("downstream rejected message".into())
    }
}

/// Handler that panics.
#[derive(Debug)]
pub struct Panicking;

#[async_trait]
impl NoticeHandler for Panicking {
    async fn on_notice(&self, _frame: Frame) -> Result<(), HandlerError> {
        panic!("notice handler exploded")
    }
}
