//! Logical messages exchanged between peers, before framing.
//!
//! A [`Message`] is serialized to UTF-8 JSON and carried as the payload of
//! a wire envelope:
//!
//! ```text
//! {"sender","timestamp","message_type","content":{...},"message_id"}
//! ```

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type tag of a logical message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
    Notification,
    Call,
    Ack,
    Heartbeat,
    Handshake,
}

impl MessageType {
    /// The string used for this type on the wire and as a dispatcher key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::File => "FILE",
            Self::Audio => "AUDIO",
            Self::Video => "VIDEO",
            Self::System => "SYSTEM",
            Self::Notification => "NOTIFICATION",
            Self::Call => "CALL",
            Self::Ack => "ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::Handshake => "HANDSHAKE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of call carried by a CALL message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
    ScreenShare,
    VoiceMessage,
}

/// Call signalling action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    Initiate,
    Accept,
    Reject,
    End,
}

/// A logical message, created by the sending peer and immutable once sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct Message {
    pub sender: String,
    /// ISO-8601 creation time.
    pub timestamp: String,
    pub message_type: MessageType,
    /// Type-specific key/value body.
    #[ts(type = "Record<string, unknown>")]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl Message {
    /// Build a message of an arbitrary type stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        message_type: MessageType,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            sender: sender.into(),
            timestamp: now_iso8601(),
            message_type,
            content,
            message_id: None,
        }
    }

    /// A TEXT message: `content = {"text": ...}`.
    pub fn text(sender: impl Into<String>, text: impl Into<String>) -> Self {
        let mut content = Map::new();
        content.insert("text".to_string(), Value::String(text.into()));
        Self::new(sender, MessageType::Text, content)
    }

    /// A CALL message: `content = {"call_type", "action", "target"}`.
    pub fn call(
        sender: impl Into<String>,
        call_type: CallType,
        action: CallAction,
        target: Option<String>,
    ) -> Self {
        let mut content = Map::new();
        content.insert("call_type".to_string(), serde_json::json!(call_type));
        content.insert("action".to_string(), serde_json::json!(action));
        content.insert(
            "target".to_string(),
            target.map(Value::String).unwrap_or(Value::Null),
        );
        Self::new(sender, MessageType::Call, content)
    }

    /// A FILE offer: `content = {"filename", "filesize", "checksum"}`.
    pub fn file(
        sender: impl Into<String>,
        filename: impl Into<String>,
        filesize: u64,
        checksum: Option<String>,
    ) -> Self {
        let mut content = Map::new();
        content.insert("filename".to_string(), Value::String(filename.into()));
        content.insert("filesize".to_string(), Value::from(filesize));
        content.insert(
            "checksum".to_string(),
            checksum.map(Value::String).unwrap_or(Value::Null),
        );
        Self::new(sender, MessageType::File, content)
    }

    /// Attach a message id.
    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// The `text` field of a TEXT message, if present.
    pub fn text_body(&self) -> Option<&str> {
        self.content.get("text").and_then(Value::as_str)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Re-materialize from an already decoded JSON value.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

/// Current UTC time as an RFC 3339 / ISO-8601 string.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_shape() {
        let msg = Message::text("alice", "Hello");
        let value = msg.to_value().expect("to value");
        assert_eq!(value["sender"], "alice");
        assert_eq!(value["message_type"], "TEXT");
        assert_eq!(value["content"]["text"], "Hello");
        assert!(value["message_id"].is_null());
        assert_eq!(msg.text_body(), Some("Hello"));
    }

    #[test]
    fn test_call_message_content() {
        let msg = Message::call("bob", CallType::ScreenShare, CallAction::Initiate, None);
        assert_eq!(msg.message_type, MessageType::Call);
        assert_eq!(msg.content["call_type"], "screen_share");
        assert_eq!(msg.content["action"], "initiate");
        assert!(msg.content["target"].is_null());
    }

    #[test]
    fn test_file_message_content() {
        let msg = Message::file("carol", "notes.txt", 1024, Some("abcd".to_string()));
        assert_eq!(msg.message_type, MessageType::File);
        assert_eq!(msg.content["filesize"], 1024);
        assert_eq!(msg.content["checksum"], "abcd");
    }

    #[test]
    fn test_json_rematerializes_equivalent_value() {
        let msg = Message::text("alice", "hi").with_id("m-1");
        let json = msg.to_json().expect("serialize");
        let parsed = Message::from_json(&json).expect("parse");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_missing_message_id_defaults_to_none() {
        let json = r#"{"sender":"a","timestamp":"2024-01-01T00:00:00Z","message_type":"HEARTBEAT","content":{}}"#;
        let parsed = Message::from_json(json).expect("parse");
        assert_eq!(parsed.message_type, MessageType::Heartbeat);
        assert!(parsed.message_id.is_none());
    }

    #[test]
    fn test_message_type_strings_match_serde() {
        for ty in [
            MessageType::Text,
            MessageType::Call,
            MessageType::File,
            MessageType::Ack,
            MessageType::Heartbeat,
            MessageType::Handshake,
        ] {
            let value = serde_json::to_value(ty).expect("serialize");
            assert_eq!(value, ty.as_str());
        }
    }

    #[test]
    fn test_timestamp_is_iso8601() {
        let ts = now_iso8601();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
