//! Frame-at-a-time I/O over byte streams.
//!
//! [`FrameReader`] buffers reads internally so that dropping a pending
//! [`FrameReader::read_frame`] future (a timeout or a shutdown signal
//! winning a `select!`) never loses bytes already taken off the socket.
//! Outbound frames go through a per-connection writer task fed by an
//! unbounded channel, which keeps frames from one producer in order and
//! lets callers send without holding any lock across I/O.

use nearmeet_crypto::chacha20;
use nearmeet_crypto::keys::SymmetricKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::wire::{self, HEADER_SIZE};
use crate::{Result, TransportError};

const READ_CHUNK: usize = 8 * 1024;

/// Sender half of a connection's outbound frame queue.
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// Reads whole frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next complete frame (header and payload bytes).
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    /// Envelope validation is left to [`wire::decode`]; only an oversized
    /// declared length is rejected here, since it cannot be skipped.
    ///
    /// Cancel safe.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Connection(format!(
                    "stream closed with {} bytes of a partial frame",
                    self.buf.len()
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = wire::declared_payload_size(&self.buf[..HEADER_SIZE])?;
        let total = HEADER_SIZE + size;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }
}

/// Encode and write a single frame, flushing afterwards.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    message_id: u32,
) -> Result<()> {
    let frame = wire::encode(payload, message_id)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Spawn a task draining `rx` into `writer` until the channel closes or a
/// write fails, then shutting the write side down.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                tracing::debug!("frame write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Seal an outbound payload when a session key is configured.
pub fn seal(key: Option<&SymmetricKey>, plaintext: Vec<u8>) -> Result<Vec<u8>> {
    match key {
        Some(key) => Ok(chacha20::encrypt(&plaintext, key)?),
        None => Ok(plaintext),
    }
}

/// Open an inbound payload sealed with [`seal`].
pub fn open(key: Option<&SymmetricKey>, payload: &[u8]) -> Result<Vec<u8>> {
    match key {
        Some(key) => Ok(chacha20::decrypt(payload, key)?),
        None => Ok(payload.to_vec()),
    }
}
