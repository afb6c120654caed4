//! Stream framing.
//!
//! Endpoints carry parcels as length-prefixed frames: a 4-byte big-endian
//! length followed by the frame body. A zero-length frame is a keepalive.
//! A declared length past [`MAX_FRAME_SIZE`] is a framing violation and the
//! connection is dropped immediately.

use crate::parcel::MAX_PAYLOAD_SIZE;
use crate::{MessageError, Result};

/// Maximum frame body size: the payload limit plus header overhead.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 256;

/// Length of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// One decoded unit from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete frame body.
    Frame(Vec<u8>),
    /// A zero-length keepalive.
    Keepalive,
}

/// Prefix a frame body with its length.
///
/// # Errors
///
/// Returns [`MessageError::FrameTooLarge`] past [`MAX_FRAME_SIZE`].
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(MessageError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// The empty keepalive frame.
pub fn keepalive_frame() -> [u8; LENGTH_PREFIX_SIZE] {
    [0u8; LENGTH_PREFIX_SIZE]
}

/// Incremental decoder over a byte stream.
///
/// Feed arriving bytes with [`FrameDecoder::extend`] and drain complete
/// frames with [`FrameDecoder::next`]. A framing violation poisons the
/// decoder; the caller must drop the connection.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// A decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::FrameTooLarge`] when the declared length
    /// violates the frame cap.
    pub fn next(&mut self) -> Result<Option<FrameEvent>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared: [u8; LENGTH_PREFIX_SIZE] = self.buffer[..LENGTH_PREFIX_SIZE]
            .try_into()
            .map_err(|_| MessageError::Malformed("short length prefix"))?;
        let length = u32::from_be_bytes(declared) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(MessageError::FrameTooLarge(length));
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        let body: Vec<u8> = self
            .buffer
            .drain(..LENGTH_PREFIX_SIZE + length)
            .skip(LENGTH_PREFIX_SIZE)
            .collect();
        if body.is_empty() {
            Ok(Some(FrameEvent::Keepalive))
        } else {
            Ok(Some(FrameEvent::Frame(body)))
        }
    }
}
