//! Length-prefixed framing for TCP streams.
//!
//! Each codec frame travels as one length-prefixed record:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   frame            |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. The record boundary is
//! what lets a zero-length section be told apart from a closed stream, so the
//! codec never has to guess where a message ends.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
const PREFIX_LEN: usize = 4;

/// Default cap on a single frame: 1 MiB.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1_048_576;

/// Configuration for the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingConfig {
    /// Maximum accepted frame size in bytes.
    pub max_frame_len: u32,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Errors from reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The frame exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared or actual frame size.
        size: u64,
        /// Configured maximum.
        max: u32,
    },

    /// The peer closed the stream before a complete frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a single frame from the stream.
///
/// Meant for peers that read one frame at a time and never race the read
/// against anything else, such as a hand-driven test peer or a simple
/// blocking tool. Not cancel-safe: dropping the future mid-frame loses the
/// bytes already consumed. The client channel and the server loop read
/// through [`FrameBuffer`] instead.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FramingConfig,
) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; PREFIX_LEN];
    reader.read_exact(&mut len_buf).await.map_err(closed_on_eof)?;

    let len = u32::from_le_bytes(len_buf);
    check_len(u64::from(len), config.max_frame_len)?;

    let mut frame = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut frame).await.map_err(closed_on_eof)?;
    }
    Ok(frame)
}

/// Write a single frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FramingConfig,
) -> Result<(), FramingError> {
    check_len(frame.len() as u64, config.max_frame_len)?;
    // Fits: max_frame_len is a u32.
    let len = frame.len() as u32;

    writer.write_all(&len.to_le_bytes()).await?;
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn check_len(size: u64, max: u32) -> Result<(), FramingError> {
    if size > u64::from(max) {
        return Err(FramingError::PayloadTooLarge { size, max });
    }
    Ok(())
}

fn closed_on_eof(e: std::io::Error) -> FramingError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Accumulates stream bytes and hands out complete frames.
///
/// [`FrameBuffer::read_frame`] keeps every byte it has read in the buffer, so
/// the future can be dropped at any `.await` (timeout, `select!`) and the
/// next call resumes where the last one stopped.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    max_frame_len: u32,
}

impl FrameBuffer {
    /// Create an empty buffer using the given limits.
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_len: config.max_frame_len,
        }
    }

    /// Extract one complete frame if the buffer holds one.
    pub fn try_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buffer.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut len_buf = [0u8; PREFIX_LEN];
        len_buf.copy_from_slice(&self.buffer[..PREFIX_LEN]);
        let len = u32::from_le_bytes(len_buf);
        check_len(u64::from(len), self.max_frame_len)?;

        let total = PREFIX_LEN + len as usize;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(PREFIX_LEN);
        let frame = self.buffer.split_to(len as usize);
        Ok(Some(frame.to_vec()))
    }

    /// Read from `reader` until one complete frame is buffered, then return it.
    ///
    /// Cancel-safe.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Vec<u8>, FramingError> {
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(frame);
            }
            if reader.read_buf(&mut self.buffer).await? == 0 {
                return Err(FramingError::ConnectionClosed);
            }
        }
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
