//! Type-keyed routing of decoded messages.
//!
//! A [`Dispatcher`] is an explicit value: construct one at startup and hand
//! it (usually behind an `Arc`) to whatever routes messages. There is no
//! process-wide registry.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::messages::message_type_of;

/// A registered handler. Returning `Ok(None)` means "no reply".
pub type HandlerFn = Arc<dyn Fn(&Value) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Routes messages to one handler per type string.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, HandlerFn>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with the stock TEXT, ACK and HEARTBEAT handlers.
    pub fn with_default_handlers() -> Self {
        let dispatcher = Self::new();
        dispatcher.register("TEXT", |message| {
            let message_id = message.get("message_id").cloned().unwrap_or(Value::Null);
            Ok(Some(json!({"status": "received", "message_id": message_id})))
        });
        dispatcher.register("ACK", |_| Ok(None));
        dispatcher.register("HEARTBEAT", |_| Ok(Some(json!({"type": "HEARTBEAT_ACK"}))));
        dispatcher
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        tracing::debug!(%message_type, "registered handler");
        self.handlers.write().insert(message_type, Arc::new(handler));
    }

    /// Remove the handler for `message_type`. Returns whether one existed.
    pub fn unregister(&self, message_type: &str) -> bool {
        self.handlers.write().remove(message_type).is_some()
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.handlers.read().contains_key(message_type)
    }

    pub fn handler_for(&self, message_type: &str) -> Option<HandlerFn> {
        self.handlers.read().get(message_type).cloned()
    }

    /// Route `message` to the handler for its `type`/`message_type` field.
    ///
    /// Missing type, unknown type, handler error and handler panic all
    /// yield `None`. The handler runs outside the registry lock, so it may
    /// itself register or unregister handlers.
    pub fn dispatch(&self, message: &Value) -> Option<Value> {
        let Some(message_type) = message_type_of(message) else {
            tracing::warn!("message without a type field, dropping");
            return None;
        };
        let Some(handler) = self.handler_for(message_type) else {
            tracing::warn!(%message_type, "no handler registered");
            return None;
        };
        invoke_guarded(message_type, || handler(message)).flatten()
    }
}

/// Run a handler or subscriber, converting errors and panics into `None`.
pub fn invoke_guarded<T>(label: &str, f: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::error!(handler = %label, "handler failed: {e:#}");
            None
        }
        Err(_) => {
            tracing::error!(handler = %label, "handler panicked");
            None
        }
    }
}
