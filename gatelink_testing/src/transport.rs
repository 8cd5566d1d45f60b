//! Scripted stand-in for the backend service.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, channel::mpsc};
use gatelink::{
    BackendMessage,
    TransportError,
    backend::{BackendChannel, BackendTransport},
};
use tokio::sync::mpsc as tokio_mpsc;

/// Outcome of one connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStep {
    /// Refuse the connection.
    Fail,
    /// Open a session and publish its [`RemoteEnd`].
    Accept,
}

/// The backend's side of an accepted session.
#[derive(Debug)]
pub struct RemoteEnd {
    received: mpsc::UnboundedReceiver<BackendMessage>,
    replies: mpsc::UnboundedSender<Result<BackendMessage, TransportError>>,
}

impl RemoteEnd {
    /// Next envelope the link wrote, or `None` once the link closed its sink.
    pub async fn recv(&mut self) -> Option<BackendMessage> { self.received.next().await }

    /// Next envelope that is not a heartbeat.
    pub async fn recv_skipping_heartbeats(&mut self) -> Option<BackendMessage> {
        loop {
            let message = self.recv().await?;
            if message.kind != gatelink::backend::MessageKind::Heartbeat {
                return Some(message);
            }
        }
    }

    /// Deliver `message` to the link.
    pub fn reply(&self, message: BackendMessage) {
        let _ = self.replies.unbounded_send(Ok(message));
    }

    /// Drop the session from the backend side.
    pub fn close(self) {}
}

/// A [`BackendTransport`] whose connect attempts follow a script.
///
/// Attempts past the end of the script fail.
#[derive(Debug)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<ConnectStep>>,
    attempts: AtomicU32,
    remotes: tokio_mpsc::UnboundedSender<RemoteEnd>,
}

impl ScriptedTransport {
    /// Create a transport and the receiver of its accepted sessions.
    pub fn new(
        steps: impl IntoIterator<Item = ConnectStep>,
    ) -> (Self, tokio_mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = tokio_mpsc::unbounded_channel();
        let transport = Self {
            steps: Mutex::new(steps.into_iter().collect()),
            attempts: AtomicU32::new(0),
            remotes,
        };
        (transport, rx)
    }

    /// Number of connect attempts made so far.
    pub fn attempts(&self) -> u32 { self.attempts.load(Ordering::SeqCst) }
}

#[async_trait]
impl BackendTransport for ScriptedTransport {
    async fn connect(&self) -> Result<BackendChannel, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if step != Some(ConnectStep::Accept) {
            return Err(TransportError::Refused("scripted failure".into()));
        }

        let (sink_tx, received) = mpsc::unbounded();
        let (replies, stream_rx) = mpsc::unbounded();
        let _ = self.remotes.send(RemoteEnd { received, replies });

        let sink = sink_tx.sink_map_err(|_| TransportError::Closed);
        Ok(BackendChannel::new(Box::pin(sink), Box::pin(stream_rx)))
    }
}
