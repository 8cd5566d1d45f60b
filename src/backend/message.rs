//! Envelope exchanged with the backend service.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::correlation::Correlatable;

/// Purpose of a backend envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Handshake,
    Heartbeat,
    Normal,
    Ack,
}

/// Outcome carried by replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// One envelope on the backend link.
///
/// `payload` is an opaque serialized document, normally JSON text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMessage {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub sender_platform: String,
    #[serde(default)]
    pub target_platform: String,
    #[serde(default)]
    pub payload: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub require_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
}

impl BackendMessage {
    fn new(kind: MessageKind, sender: &str, target: &str, payload: String) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            kind,
            sender_platform: sender.to_owned(),
            target_platform: target.to_owned(),
            payload,
            timestamp: unix_now(),
            require_ack: false,
            status: None,
        }
    }

    /// Opening message of every session.
    #[must_use]
    pub fn handshake(platform: &str) -> Self {
        Self::new(
            MessageKind::Handshake,
            platform,
            "",
            json!({"action": "connect"}).to_string(),
        )
    }

    /// Keep-alive sent when the outbound queue is idle.
    #[must_use]
    pub fn heartbeat(platform: &str) -> Self {
        Self::new(MessageKind::Heartbeat, platform, "", String::new())
    }

    /// Ordinary payload-carrying message.
    #[must_use]
    pub fn normal(platform: &str, target: &str, payload: String, require_ack: bool) -> Self {
        Self {
            require_ack,
            ..Self::new(MessageKind::Normal, platform, target, payload)
        }
    }

    /// Acknowledgement of `self`, addressed back to its sender.
    #[must_use]
    pub fn ack(&self, platform: &str) -> Self {
        Self {
            message_id: self.message_id.clone(),
            status: Some(ResponseStatus::Success),
            ..Self::new(
                MessageKind::Ack,
                platform,
                &self.sender_platform,
                json!({"status": "received"}).to_string(),
            )
        }
    }

    /// Decode the payload as JSON; an empty payload decodes as `{}`.
    ///
    /// # Errors
    ///
    /// Returns the decode error when the payload is not valid JSON.
    pub fn payload_json(&self) -> Result<Value, serde_json::Error> {
        if self.payload.is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str(&self.payload)
        }
    }
}

impl Correlatable for BackendMessage {
    fn correlation_id(&self) -> Option<String> { Some(self.message_id.clone()) }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
