//! # nearmeet-transport
//!
//! Peer-to-peer messaging transport for NearMeet over plain TCP.
//!
//! - **Wire envelope** framing and validation via [`wire`]
//! - **Control bodies** (handshake, ACK, heartbeat) via [`messages`]
//! - **Stream framing** over TCP halves via [`framing`]
//! - **Type-keyed dispatch** of decoded messages via [`dispatch`]
//! - **Connection server** (accept loop, peer registry, broadcast) via [`server`]
//! - **Connection client** (handshake, receive loop, reconnect) via [`client`]
//!
//! ## Architecture
//!
//! ```text
//! Message / control JSON
//!     |
//!     v
//! optional ChaCha20-Poly1305 seal (nearmeet-crypto)
//!     |
//!     v
//! Envelope (wire.rs)        -- "NEAR" | ver | id | size | reserved | payload
//!     |
//!     v
//! FrameReader / write_frame -- one task per connection, timed reads
//!     |
//!     v
//! TCP socket
//! ```

pub mod client;
pub mod dispatch;
pub mod framing;
pub mod messages;
pub mod server;
pub mod wire;

use nearmeet_crypto::CryptoError;

pub use wire::FrameError;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A frame failed envelope validation.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket read/write/accept failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound connection could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// A bounded operation ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The peer's handshake was missing or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// The server is already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Payload encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Identifies a handler registered on a [`server::Server`] or
/// [`client::Client`], for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);
