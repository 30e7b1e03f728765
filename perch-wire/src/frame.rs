//! Length-prefix framing.
//!
//! Every message in either direction is `[len: u32 big-endian][payload]`.
//! `len` counts payload bytes only and must be below the receiver's
//! configured maximum; the receive side treats anything outside
//! `(0, max)` as a fatal protocol error.

use bytes::BufMut;

/// Default cap on a single frame's payload (4 MiB).
pub const DEFAULT_PACKET_LEN_MAX: usize = 4 * 1024 * 1024;

/// Prepend the length prefix to an encoded payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Validate a just-read length prefix against the configured cap.
///
/// The prefix is read as `i32` so that a corrupt high bit shows up as a
/// negative length rather than a huge allocation.
pub fn check_frame_len(len: i32, max: usize) -> Result<usize, FrameLenError> {
    if len <= 0 {
        return Err(FrameLenError::OutOfRange { len, max });
    }
    let len = len as usize;
    if len >= max {
        return Err(FrameLenError::OutOfRange { len: len as i32, max });
    }
    Ok(len)
}

/// A length prefix outside the accepted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLenError {
    OutOfRange { len: i32, max: usize },
}

impl std::fmt::Display for FrameLenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameLenError::OutOfRange { len, max } => {
                write!(f, "frame length {len} outside (0, {max})")
            }
        }
    }
}

impl std::error::Error for FrameLenError {}
