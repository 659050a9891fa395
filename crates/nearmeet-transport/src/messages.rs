//! Control bodies and received-payload typing.
//!
//! Control messages are logical JSON bodies, not yet framed:
//!
//! ```text
//! {"type":"HANDSHAKE","protocol_version":1,"timestamp"}
//! {"type":"ACK","message_id","timestamp"}
//! {"type":"HEARTBEAT","timestamp"}
//! ```

use nearmeet_types::message::now_iso8601;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::PROTOCOL_VERSION;
use crate::Result;

/// Frame id carrying the handshake and its ACK.
pub const HANDSHAKE_MESSAGE_ID: u32 = 0;

/// Protocol control message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Control {
    Handshake {
        protocol_version: u8,
        timestamp: String,
    },
    Ack {
        message_id: u32,
        timestamp: String,
    },
    Heartbeat {
        timestamp: String,
    },
}

impl Control {
    pub fn handshake() -> Self {
        Self::Handshake {
            protocol_version: PROTOCOL_VERSION,
            timestamp: now_iso8601(),
        }
    }

    /// Acknowledge the frame with the given id.
    pub fn ack(message_id: u32) -> Self {
        Self::Ack {
            message_id,
            timestamp: now_iso8601(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: now_iso8601(),
        }
    }

    /// Serialize to the UTF-8 JSON payload bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Interpret a decoded JSON value as a control message, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    /// `true` for an ACK of `message_id`.
    pub fn is_ack_for(&self, message_id: u32) -> bool {
        matches!(self, Self::Ack { message_id: id, .. } if *id == message_id)
    }
}

/// A received payload, typed once at the parse boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Payload parsed as JSON.
    Json(Value),
    /// Payload that is not JSON, kept as (lossy) UTF-8 text.
    Raw(String),
}

impl Payload {
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Type tag of a JSON payload; see [`message_type_of`].
    pub fn message_type(&self) -> Option<&str> {
        self.as_json().and_then(message_type_of)
    }
}

/// Read the type tag from a `type` field (control bodies) or a
/// `message_type` field (logical messages). A `type` that is null, empty
/// or not a string falls through to `message_type`.
pub fn message_type_of(value: &Value) -> Option<&str> {
    value
        .get("type")
        .and_then(Value::as_str)
        .filter(|tag| !tag.is_empty())
        .or_else(|| value.get("message_type").and_then(Value::as_str))
}
