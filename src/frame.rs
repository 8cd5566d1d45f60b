//! Decoded gateway frames and their discriminator.
//!
//! The gateway speaks JSON objects. Event frames carry a `post_type` field
//! naming the event family; a frame without one answers an earlier request
//! and is matched back to it by its `echo` field.

use std::fmt;

use serde_json::{Map, Value};

use crate::{correlation::Correlatable, error::ProtocolError};

/// Field selecting the event family.
pub const DISCRIMINATOR_KEY: &str = "post_type";
/// Field carrying the request identity on calls and replies.
pub const ECHO_KEY: &str = "echo";

/// Classification of a gateway frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A chat message event.
    Message,
    /// A protocol meta event such as a heartbeat or lifecycle notification.
    MetaEvent,
    /// A notice event such as a member change.
    Notice,
    /// A reply to an earlier call; no discriminator is present.
    Reply,
    /// A discriminator this relay does not handle.
    Unknown(String),
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Message => f.write_str("message"),
            FrameKind::MetaEvent => f.write_str("meta_event"),
            FrameKind::Notice => f.write_str("notice"),
            FrameKind::Reply => f.write_str("reply"),
            FrameKind::Unknown(other) => write!(f, "unknown({other})"),
        }
    }
}

/// A decoded gateway JSON object.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame(Map<String, Value>);

impl Frame {
    /// Wrap a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotAnObject`] unless `value` is an object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(object) => Ok(Self(object)),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    /// Decode a frame from raw text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] for invalid JSON and
    /// [`ProtocolError::NotAnObject`] for non-object documents.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Classify the frame by its discriminator.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.0.get(DISCRIMINATOR_KEY) {
            None | Some(Value::Null) => FrameKind::Reply,
            Some(Value::String(kind)) => match kind.as_str() {
                "message" => FrameKind::Message,
                "meta_event" => FrameKind::MetaEvent,
                "notice" => FrameKind::Notice,
                other => FrameKind::Unknown(other.to_owned()),
            },
            Some(other) => FrameKind::Unknown(other.to_string()),
        }
    }

    /// Look up a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }

    /// Request identity echoed back by the gateway, if any.
    ///
    /// Numeric identities are rendered as strings.
    #[must_use]
    pub fn echo(&self) -> Option<String> {
        match self.0.get(ECHO_KEY)? {
            Value::String(echo) => Some(echo.clone()),
            Value::Number(echo) => Some(echo.to_string()),
            _ => None,
        }
    }

    /// Whether this is a `meta_event` heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.kind() == FrameKind::MetaEvent
            && self.0.get("meta_event_type").and_then(Value::as_str) == Some("heartbeat")
    }

    /// Borrow the underlying object.
    #[must_use]
    pub fn as_object(&self) -> &Map<String, Value> { &self.0 }

    /// Consume the frame, returning it as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value { Value::Object(self.0) }
}

impl Correlatable for Frame {
    fn correlation_id(&self) -> Option<String> { self.echo() }
}
