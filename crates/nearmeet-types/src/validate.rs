//! Validators for user-supplied configuration and message input.

use crate::{MAX_MESSAGE_LENGTH, MAX_USERNAME_LENGTH, MIN_USERNAME_LENGTH};

/// Reasons an input was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("username cannot be empty")]
    EmptyUsername,

    #[error("username must be between {min} and {max} characters")]
    UsernameLength { min: usize, max: usize },

    #[error("username can only contain letters, numbers, underscores, and hyphens")]
    UsernameCharacters,

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("password is too weak: {0}")]
    WeakPassword(&'static str),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Username: 3..=32 characters from `[A-Za-z0-9_-]`.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    let len = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&len) {
        return Err(ValidationError::UsernameLength {
            min: MIN_USERNAME_LENGTH,
            max: MAX_USERNAME_LENGTH,
        });
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::UsernameCharacters);
    }
    Ok(())
}

/// Port 0 is reserved for "OS-assigned" and is not a valid peer port.
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(ValidationError::InvalidPort);
    }
    Ok(())
}

/// Chat body: non-blank and at most [`MAX_MESSAGE_LENGTH`] characters.
pub fn validate_message(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ValidationError::MessageTooLong {
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(())
}

/// Password strength: length, lower case, upper case and a digit.
pub fn validate_password(password: &str, min_length: usize) -> Result<()> {
    if password.chars().count() < min_length {
        return Err(ValidationError::WeakPassword("too short"));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::WeakPassword("missing a lowercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::WeakPassword("missing an uppercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::WeakPassword("missing a digit"));
    }
    Ok(())
}
