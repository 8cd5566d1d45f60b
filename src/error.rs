//! Canonical error types shared across the relay.
//!
//! Each component defines its own error enum; the types here cover the
//! cross-cutting categories. [`TransportError`] is connection-level and sends
//! the owning connection down its reconnect path. [`ProtocolError`] marks a
//! single malformed unit that is logged and dropped. [`AdapterError`] carries
//! the outcomes that end the process.

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, http::header::InvalidHeaderValue};

use crate::{
    backend::BackendError,
    config::ConfigError,
    fragment::FragmentError,
    gateway::GatewayError,
};

/// Connection-level failure on either side of the relay.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level I/O failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    /// WebSocket protocol or handshake failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// A configured access token cannot be sent as a header.
    #[error("access token is not a valid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    /// The peer refused or could not be reached.
    #[error("connection refused: {0}")]
    Refused(String),
    /// An outbound envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    /// The transport closed underneath the caller.
    #[error("transport closed")]
    Closed,
}

/// A single malformed inbound unit.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame decoded but was not a JSON object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// A chunk fragment was malformed or inconsistent.
    #[error("malformed fragment: {0}")]
    Fragment(#[from] FragmentError),
}

/// Outcomes that stop the whole adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The gateway side failed fatally (for example, the listener could not bind).
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The backend link gave up reconnecting.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
