//! Versioned binary envelope for NearMeet frames.
//!
//! ## Wire format (big-endian)
//!
//! ```text
//! magic(4B) = "NEAR"
//! version(1B) = 1
//! message_id(4B)
//! payload_size(4B)
//! reserved(7B) = 0x00 x 7
//! payload(payload_size B)
//! ```
//!
//! Encoding and decoding are pure. Envelopes are built once, sent, and
//! discarded.

/// Protocol tag at the start of every frame.
pub const MAGIC: [u8; 4] = *b"NEAR";

/// Current NearMeet protocol version.
pub const PROTOCOL_VERSION: u8 = nearmeet_types::PROTOCOL_VERSION;

/// Size of the reserved header block.
pub const RESERVED_SIZE: usize = 7;

/// Fixed header size: 4 + 1 + 4 + 4 + 7.
pub const HEADER_SIZE: usize = 20;

/// Largest payload accepted on either side (to prevent allocation attacks).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const VERSION_OFFSET: usize = 4;
const ID_OFFSET: usize = 5;
const SIZE_OFFSET: usize = 9;

/// Envelope validation failures. Each is fatal to one frame only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a header.
    #[error("frame too short: {len} bytes, header is {HEADER_SIZE}")]
    FrameTooShort { len: usize },

    /// Leading four bytes are not `NEAR`.
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Version byte differs from [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version {0}, expected {PROTOCOL_VERSION}")]
    UnsupportedVersion(u8),

    /// Bytes after the header do not match the declared payload size.
    #[error("payload size mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes, max {MAX_PAYLOAD_SIZE}")]
    FrameTooLarge { size: usize },
}

/// Frame `payload` behind a header carrying `message_id`.
///
/// # Errors
///
/// Returns [`FrameError::FrameTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode(payload: &[u8], message_id: u32) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: payload.len(),
        });
    }
    // Bounded by MAX_PAYLOAD_SIZE above.
    let size = payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validate a complete frame and return `(message_id, payload)`.
///
/// Checks run in order: length, magic, version, payload size.
pub fn decode(buffer: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    if buffer.len() < HEADER_SIZE {
        return Err(FrameError::FrameTooShort { len: buffer.len() });
    }

    let magic = read_array::<4>(buffer, 0);
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let version = buffer[VERSION_OFFSET];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let message_id = u32::from_be_bytes(read_array::<4>(buffer, ID_OFFSET));
    let declared = u32::from_be_bytes(read_array::<4>(buffer, SIZE_OFFSET)) as usize;
    let payload = &buffer[HEADER_SIZE..];
    if payload.len() != declared {
        return Err(FrameError::SizeMismatch {
            declared,
            actual: payload.len(),
        });
    }

    Ok((message_id, payload))
}

/// Payload size declared by a header, without validating magic or version.
///
/// Used by stream readers to know how many bytes make up the next frame.
pub fn declared_payload_size(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < HEADER_SIZE {
        return Err(FrameError::FrameTooShort { len: header.len() });
    }
    let size = u32::from_be_bytes(read_array::<4>(header, SIZE_OFFSET)) as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::FrameTooLarge { size });
    }
    Ok(size)
}

/// Caller guarantees `offset + N <= buf.len()`.
fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}
