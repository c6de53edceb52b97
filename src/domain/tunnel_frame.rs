//! Length-prefixed framing used on the tunnel backend socket.
//!
//! ```text
//! ┌──────────────────────┬───────────────────────┐
//! │  length (u32, BE)    │    payload[length]    │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! The link side carries the same payload without the prefix.

use thiserror::Error;

pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelFrameError {
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

/// Prefix `payload` with its big-endian length.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, TunnelFrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| TunnelFrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Streaming decoder for bytes read off the backend socket.
///
/// Reads may split or merge frames arbitrarily; bytes are buffered until a
/// whole frame is available.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Frames longer than `max_frame_len` are rejected.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame's payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TunnelFrameError> {
        let Some(prefix) = self.buffer.get(..LENGTH_PREFIX_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > self.max_frame_len {
            return Err(TunnelFrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buffer.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }
        let payload = self.buffer[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len].to_vec();
        self.buffer.drain(..LENGTH_PREFIX_LEN + len);
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
