//! Default handlers that relay traffic between the two sides.
//!
//! Gateway `message` and `notice` events are forwarded to the backend
//! fire-and-forget; `meta_event` frames are only logged. Payloads arriving
//! from the backend are written to the gateway unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::{
    adapter::Adapter,
    backend::{BackendHandler, BackendLink, BackendMessage},
    frame::Frame,
    gateway::GatewayConnection,
    pipeline::{HandlerError, Handlers, MessageHandler, MetaEventHandler, NoticeHandler},
};

/// Forwards gateway events to the backend.
#[derive(Debug)]
pub struct GatewayRelay {
    backend: Arc<BackendLink>,
    target: String,
}

impl GatewayRelay {
    #[must_use]
    pub fn new(backend: Arc<BackendLink>, target: impl Into<String>) -> Self {
        Self {
            backend,
            target: target.into(),
        }
    }

    async fn forward(&self, frame: Frame) -> Result<(), HandlerError> {
        self.backend
            .send(&frame.into_value(), false, &self.target)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for GatewayRelay {
    async fn on_message(&self, frame: Frame) -> Result<(), HandlerError> { self.forward(frame).await }
}

#[async_trait]
impl NoticeHandler for GatewayRelay {
    async fn on_notice(&self, frame: Frame) -> Result<(), HandlerError> { self.forward(frame).await }
}

#[async_trait]
impl MetaEventHandler for GatewayRelay {
    async fn on_meta_event(&self, frame: Frame) -> Result<(), HandlerError> {
        let meta_type = frame
            .get("meta_event_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if frame.is_heartbeat() {
            debug!("gateway heartbeat received");
        } else {
            let sub_type = frame.get("sub_type").and_then(Value::as_str).unwrap_or("");
            info!("gateway meta event: meta_event_type={meta_type}, sub_type={sub_type}");
        }
        Ok(())
    }
}

/// Writes backend payloads to the gateway.
#[derive(Debug)]
pub struct BackendRelay {
    gateway: Arc<GatewayConnection>,
}

impl BackendRelay {
    #[must_use]
    pub fn new(gateway: Arc<GatewayConnection>) -> Self { Self { gateway } }
}

#[async_trait]
impl BackendHandler for BackendRelay {
    async fn on_backend_message(
        &self,
        message: BackendMessage,
        payload: Value,
    ) -> Result<(), HandlerError> {
        debug!(
            "relaying backend payload: message_id={}, sender={}",
            message.message_id, message.sender_platform
        );
        self.gateway.send_frame(&payload).await?;
        Ok(())
    }
}

/// Handlers used by the binary: gateway events go to the backend and
/// backend payloads go to the gateway.
#[must_use]
pub fn default_handlers(adapter: &Adapter) -> (Handlers, Arc<dyn BackendHandler>) {
    let relay = Arc::new(GatewayRelay::new(Arc::clone(adapter.backend()), ""));
    let handlers = Handlers::new(
        Arc::clone(&relay) as Arc<dyn MessageHandler>,
        Arc::clone(&relay) as Arc<dyn NoticeHandler>,
        relay as Arc<dyn MetaEventHandler>,
    );
    let backend_handler = Arc::new(BackendRelay::new(Arc::clone(adapter.gateway())));
    (handlers, backend_handler)
}
