//! # nearmeet-chat
//!
//! In-memory chat history for NearMeet.
//!
//! - [`store`]: the thread-safe message log with queries, edits, reactions
//!   and subscriber notification
//! - [`sink`]: the seam to an external persistence layer
//! - [`format`]: plain-text rendering of stored messages

pub mod format;
pub mod sink;
pub mod store;

pub use sink::{HistorySink, MemorySink};
pub use store::{ChatStore, SubscriptionId};

/// Error types for chat history operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The external history sink failed to save or load.
    #[error("history sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
