//! Thread-safe chat message log.
//!
//! One mutex guards both the log and the subscriber list. Subscribers run
//! while that lock is held, right after the append, so they see messages in
//! insertion order. A subscriber must therefore not call back into the
//! same store; hand the message off (a channel, a print) instead.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use nearmeet_types::ChatMessage;
use parking_lot::Mutex;

use crate::sink::HistorySink;
use crate::Result;

/// Callback invoked with each newly added message.
pub type Subscriber = Box<dyn Fn(&ChatMessage) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`ChatStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    messages: Vec<ChatMessage>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl Inner {
    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.message_id == message_id)
    }

    fn find_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
    }
}

/// Append-only (modulo delete) log of chat messages.
#[derive(Default)]
pub struct ChatStore {
    inner: Mutex<Inner>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` and notify every subscriber once.
    ///
    /// Returns `false` without appending or notifying if a message with the
    /// same id is already stored.
    pub fn add(&self, message: ChatMessage) -> bool {
        let mut inner = self.inner.lock();
        if inner.position(&message.message_id).is_some() {
            tracing::warn!(message_id = %message.message_id, "duplicate message id ignored");
            return false;
        }
        tracing::debug!(sender = %message.sender, message_id = %message.message_id, "message added");
        inner.messages.push(message);

        let inner = &*inner;
        if let Some(added) = inner.messages.last() {
            for (id, subscriber) in &inner.subscribers {
                notify(*id, subscriber, added);
            }
        }
        true
    }

    /// Messages in insertion order, skipping `offset` and returning at most
    /// `limit` (all remaining when `None`).
    pub fn get(&self, limit: Option<usize>, offset: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock();
        let rest = inner.messages.iter().skip(offset);
        match limit {
            Some(limit) => rest.take(limit).cloned().collect(),
            None => rest.cloned().collect(),
        }
    }

    pub fn get_by_id(&self, message_id: &str) -> Option<ChatMessage> {
        let inner = self.inner.lock();
        inner
            .messages
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
    }

    pub fn get_by_user(&self, username: &str) -> Vec<ChatMessage> {
        self.filtered(|m| m.sender == username)
    }

    /// Messages stamped strictly after `timestamp`.
    pub fn get_after(&self, timestamp: DateTime<Utc>) -> Vec<ChatMessage> {
        self.filtered(|m| m.timestamp > timestamp)
    }

    /// Messages whose content contains `keyword`.
    pub fn search(&self, keyword: &str, case_sensitive: bool) -> Vec<ChatMessage> {
        if case_sensitive {
            self.filtered(|m| m.content.contains(keyword))
        } else {
            let needle = keyword.to_lowercase();
            self.filtered(|m| m.content.to_lowercase().contains(&needle))
        }
    }

    pub fn delete(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.position(message_id) {
            Some(index) => {
                inner.messages.remove(index);
                tracing::info!(%message_id, "message deleted");
                true
            }
            None => false,
        }
    }

    /// Replace the content of a message, keeping its identity.
    pub fn edit(&self, message_id: &str, new_content: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        match inner.find_mut(message_id) {
            Some(message) => {
                message.content = new_content.into();
                tracing::info!(%message_id, "message edited");
                true
            }
            None => false,
        }
    }

    /// Record `username` reacting with `emoji`. Repeating a reaction has no
    /// further effect. Returns `false` only for an unknown id.
    pub fn add_reaction(&self, message_id: &str, emoji: &str, username: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.find_mut(message_id) {
            Some(message) => {
                message
                    .reactions
                    .entry(emoji.to_string())
                    .or_default()
                    .insert(username.to_string());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().messages.clear();
        tracing::info!("chat cleared");
    }

    pub fn count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Register a callback for newly added messages.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&ChatMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(existing, _)| *existing != id);
        inner.subscribers.len() != before
    }

    /// Hand every stored message to `sink`, in order. The log is
    /// snapshotted first; the sink runs without the lock held.
    pub fn flush_to(&self, sink: &dyn HistorySink) -> Result<usize> {
        let snapshot = self.get(None, 0);
        for message in &snapshot {
            sink.save(message)?;
        }
        tracing::debug!(count = snapshot.len(), "history flushed");
        Ok(snapshot.len())
    }

    /// Load messages from `sink` and append those not already stored.
    /// Subscribers are not notified. Returns how many were appended.
    pub fn restore_from(&self, sink: &dyn HistorySink) -> Result<usize> {
        let loaded = sink.load()?;
        let mut inner = self.inner.lock();
        let mut restored = 0;
        for message in loaded {
            if inner.position(&message.message_id).is_none() {
                inner.messages.push(message);
                restored += 1;
            }
        }
        tracing::debug!(restored, "history restored");
        Ok(restored)
    }

    fn filtered(&self, keep: impl Fn(&ChatMessage) -> bool) -> Vec<ChatMessage> {
        let inner = self.inner.lock();
        inner.messages.iter().filter(|m| keep(m)).cloned().collect()
    }
}

fn notify(id: SubscriptionId, subscriber: &Subscriber, message: &ChatMessage) {
    match panic::catch_unwind(AssertUnwindSafe(|| subscriber(message))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(subscription = ?id, "subscriber failed: {e:#}"),
        Err(_) => tracing::error!(subscription = ?id, "subscriber panicked"),
    }
}
