//! ChaCha20-Poly1305 AEAD encryption (RFC 8439).
//!
//! [`encrypt`]/[`decrypt`] produce and consume the self-contained layout
//! `nonce(12) || ciphertext || tag(16)` with a fresh random nonce per call.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::keys::SymmetricKey;
use crate::{CryptoError, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Bytes added to every plaintext by [`encrypt`].
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypt `plaintext` under `key` with a random nonce.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = encrypt_with_nonce(key, &nonce, plaintext, &[])?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt the output of [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::AuthenticationFailed`] for tampered input, a
/// wrong key, or input too short to hold a nonce and tag.
pub fn decrypt(ciphertext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    if ciphertext.len() < OVERHEAD {
        return Err(CryptoError::AuthenticationFailed);
    }
    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
    let mut nonce_arr = [0u8; NONCE_SIZE];
    nonce_arr.copy_from_slice(nonce);
    decrypt_with_nonce(key, &nonce_arr, sealed, &[])
}

/// Encrypt with a caller-supplied nonce and associated data.
///
/// The nonce must never be reused with the same key.
pub fn encrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::InvalidInput("encryption failed".to_string()))
}

/// Decrypt with a caller-supplied nonce and associated data.
pub fn decrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
