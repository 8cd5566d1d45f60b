//! Builders for gateway frames.

use serde_json::{Value, json};

/// A private chat message event.
pub fn message_event(text: &str) -> Value {
    json!({
        "post_type": "message",
        "message_type": "private",
        "user_id": 10001,
        "raw_message": text,
    })
}

/// A notice event of the given subtype.
pub fn notice_event(notice_type: &str) -> Value {
    json!({"post_type": "notice", "notice_type": notice_type})
}

/// A heartbeat meta event.
pub fn heartbeat_event() -> Value {
    json!({
        "post_type": "meta_event",
        "meta_event_type": "heartbeat",
        "interval": 30000,
    })
}

/// An action reply carrying `echo`.
pub fn reply(echo: &str, data: Value) -> Value {
    json!({"status": "ok", "retcode": 0, "data": data, "echo": echo})
}
