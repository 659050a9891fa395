//! Stored chat message form.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageType};

/// A chat message as kept by the chat store.
///
/// Identity (`message_id`) is fixed at creation; `content` and `reactions`
/// may be mutated in place by edits and reactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct ChatMessage {
    #[serde(rename = "id")]
    pub message_id: String,
    pub sender: String,
    pub content: String,
    #[ts(type = "string")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Emoji to the set of users who reacted with it.
    #[serde(default)]
    #[ts(type = "Record<string, string[]>")]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
}

impl ChatMessage {
    /// Create a message with a fresh UUID v4 id and the current time.
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_encrypted: false,
            attachments: Vec::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
        }
    }

    /// Use an explicit id instead of a generated one.
    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Override the creation time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark as a reply to another message.
    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Append an attachment reference.
    pub fn with_attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachments.push(reference.into());
        self
    }

    /// Flag the content as having travelled encrypted.
    pub fn encrypted(mut self, is_encrypted: bool) -> Self {
        self.is_encrypted = is_encrypted;
        self
    }

    /// Stored form of a received TEXT message.
    ///
    /// Keeps the sender's message id when present and its timestamp when it
    /// parses as RFC 3339; otherwise a fresh id and the receive time are
    /// used. Returns `None` for non-TEXT messages or a missing `text` field.
    pub fn from_wire(message: &Message) -> Option<Self> {
        if message.message_type != MessageType::Text {
            return None;
        }
        let mut stored = Self::new(message.sender.clone(), message.text_body()?);
        if let Some(id) = &message.message_id {
            stored.message_id = id.clone();
        }
        if let Ok(sent) = DateTime::parse_from_rfc3339(&message.timestamp) {
            stored.timestamp = sent.with_timezone(&Utc);
        }
        Some(stored)
    }

    /// Users who reacted with `emoji`.
    pub fn reactors(&self, emoji: &str) -> Option<&BTreeSet<String>> {
        self.reactions.get(emoji)
    }
}
