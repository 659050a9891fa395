//! PBKDF2-HMAC-SHA256 key derivation and password hashing.
//!
//! The same password and salt always yield the same key, which is what
//! makes [`verify_password`] possible. Password hashes are simply derived
//! keys; the salt must be stored next to the hash.

use sha2::Sha256;

use crate::keys::{Salt, SymmetricKey, KEY_SIZE};
use crate::{CryptoError, Result};

/// Lowest iteration count accepted by [`KdfParams`].
pub const MIN_ITERATIONS: u32 = 100_000;

/// Default iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Tunable KDF cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KdfParams {
    /// Parameters with a custom iteration count.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] below [`MIN_ITERATIONS`].
    pub fn with_iterations(iterations: u32) -> Result<Self> {
        let params = Self { iterations };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if self.iterations < MIN_ITERATIONS {
            return Err(CryptoError::KeyDerivation(format!(
                "iteration count {} is below the minimum {MIN_ITERATIONS}",
                self.iterations
            )));
        }
        Ok(())
    }
}

/// Derive a 256-bit key from a password.
///
/// When `salt` is `None` a fresh random salt is generated; the salt used
/// is returned with the key either way.
pub fn derive_key(
    password: &str,
    salt: Option<&Salt>,
    params: KdfParams,
) -> Result<(SymmetricKey, Salt)> {
    params.validate()?;
    let salt = salt.cloned().unwrap_or_else(Salt::generate);

    let mut out = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        params.iterations,
        &mut out,
    );

    Ok((SymmetricKey::from_bytes(out), salt))
}

/// A stored password hash.
pub type PasswordHash = SymmetricKey;

/// Hash a password with a fresh salt.
pub fn hash_password(password: &str, params: KdfParams) -> Result<(PasswordHash, Salt)> {
    derive_key(password, None, params)
}

/// Re-derive from `password` and `salt` and compare with `hash` in
/// constant time. Any derivation failure counts as a mismatch.
pub fn verify_password(password: &str, hash: &PasswordHash, salt: &Salt, params: KdfParams) -> bool {
    match derive_key(password, Some(salt), params) {
        Ok((candidate, _)) => crate::ct_eq(candidate.as_bytes(), hash.as_bytes()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_bytes(*b"1234567890123456");
        let (k1, s1) = derive_key("mypassword", Some(&salt), KdfParams::default()).expect("derive");
        let (k2, s2) = derive_key("mypassword", Some(&salt), KdfParams::default()).expect("derive");
        assert_eq!(k1, k2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_derive_key_generates_salt() {
        let (k1, s1) = derive_key("mypassword", None, KdfParams::default()).expect("derive");
        let (k2, s2) = derive_key("mypassword", Some(&s1), KdfParams::default()).expect("derive");
        assert_eq!(k1, k2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_different_salts_give_different_keys() {
        let a = Salt::from_bytes([1; 16]);
        let b = Salt::from_bytes([2; 16]);
        let (k1, _) = derive_key("pw", Some(&a), KdfParams::default()).expect("derive");
        let (k2, _) = derive_key("pw", Some(&b), KdfParams::default()).expect("derive");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_low_iteration_count_rejected() {
        assert!(KdfParams::with_iterations(1_000).is_err());
        assert!(KdfParams::with_iterations(MIN_ITERATIONS).is_ok());
        let weak = KdfParams { iterations: 10 };
        assert!(matches!(
            derive_key("pw", None, weak),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_verify_password_correct_and_incorrect() {
        let (hash, salt) = hash_password("MyPassword123", KdfParams::default()).expect("hash");
        assert!(verify_password("MyPassword123", &hash, &salt, KdfParams::default()));
        assert!(!verify_password("WrongPassword", &hash, &salt, KdfParams::default()));
    }

    #[test]
    fn test_verify_password_with_weak_params_is_false() {
        let (hash, salt) = hash_password("MyPassword123", KdfParams::default()).expect("hash");
        let weak = KdfParams { iterations: 1 };
        assert!(!verify_password("MyPassword123", &hash, &salt, weak));
    }
}
