//! Strategy seam for reaching the backend.
//!
//! A [`BackendTransport`] opens one session at a time and hands back a
//! [`BackendChannel`]: a sink for outbound envelopes and a stream of inbound
//! ones. The link owns reconnects, heartbeats, and acknowledgement; the
//! transport only moves envelopes.

use std::{fmt, pin::Pin};

use async_trait::async_trait;
use futures::{Sink, Stream};

use super::BackendMessage;
use crate::error::TransportError;

/// Outbound half of a session.
pub type MessageSink = Pin<Box<dyn Sink<BackendMessage, Error = TransportError> + Send>>;
/// Inbound half of a session. The stream ends or yields an error when the
/// session is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BackendMessage, TransportError>> + Send>>;

/// One live session with the backend.
pub struct BackendChannel {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl BackendChannel {
    #[must_use]
    pub fn new(sink: MessageSink, stream: MessageStream) -> Self { Self { sink, stream } }
}

impl fmt::Debug for BackendChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendChannel").finish_non_exhaustive()
    }
}

/// Opens sessions with the backend.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Establish a new session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the backend cannot be reached.
    async fn connect(&self) -> Result<BackendChannel, TransportError>;
}
