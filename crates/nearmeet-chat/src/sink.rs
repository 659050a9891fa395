//! Seam to an external persistence layer.
//!
//! The chat store defines no on-disk format. A [`HistorySink`] receives
//! messages one at a time and hands them back in insertion order.

use nearmeet_types::ChatMessage;
use parking_lot::Mutex;

use crate::Result;

/// External history storage, called only with `save`/`load`-shaped calls.
pub trait HistorySink: Send + Sync {
    /// Persist one message. Saving an id twice replaces the earlier copy.
    fn save(&self, message: &ChatMessage) -> Result<()>;

    /// All persisted messages, oldest first.
    fn load(&self) -> Result<Vec<ChatMessage>>;
}

/// A [`HistorySink`] held in memory.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySink for MemorySink {
    fn save(&self, message: &ChatMessage) -> Result<()> {
        let mut messages = self.messages.lock();
        match messages
            .iter_mut()
            .find(|m| m.message_id == message.message_id)
        {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.messages.lock().clone())
    }
}
