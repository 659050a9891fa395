//! # nearmeet-types
//!
//! Shared domain types used across the NearMeet workspace: the logical
//! wire [`message::Message`], the stored [`chat::ChatMessage`], connection
//! state enums and input validators.

pub mod chat;
pub mod message;
pub mod status;
pub mod validate;

pub use chat::ChatMessage;
pub use message::{CallAction, CallType, Message, MessageType};
pub use status::{ConnectionState, ServerState};

/// Wire protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default peer address for client mode.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default bind address for server mode.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 5000;

/// Username used when none is configured.
pub const DEFAULT_USERNAME: &str = "Anonymous";

/// Default I/O timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum length of a chat message body, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Minimum username length, in characters.
pub const MIN_USERNAME_LENGTH: usize = 3;

/// Maximum username length, in characters.
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Interval between client heartbeats, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default number of reconnect attempts.
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay between reconnect attempts, in seconds.
pub const RECONNECT_INTERVAL_SECS: u64 = 2;

/// Default maximum simultaneous peers on a server.
pub const MAX_CLIENTS: usize = 100;
