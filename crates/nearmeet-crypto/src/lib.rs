//! # nearmeet-crypto
//!
//! Symmetric confidentiality and password verification for NearMeet,
//! independent of the transport.
//!
//! ## Modules
//!
//! - [`keys`]: 256-bit symmetric keys and salts, zeroized on drop
//! - [`kdf`]: PBKDF2-HMAC-SHA256 key derivation and password hashing
//! - [`chacha20`]: ChaCha20-Poly1305 AEAD with per-message random nonces

pub mod chacha20;
pub mod kdf;
pub mod keys;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: tampered ciphertext or wrong key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Key derivation failed or was configured below the minimum cost.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encoded key material could not be parsed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Compare two byte strings without early exit on the first difference.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
