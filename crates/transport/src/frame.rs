//! Channel framing for the multiplexed backends.
//!
//! The TCP and shell-tunnel transports carry the packet protocol and any
//! number of data streams over a single byte pipe. Each frame is an 8-byte
//! header — channel id and payload length, both big-endian `u32` — followed
//! by the payload. Channel [`PACKET_CHANNEL`] is reserved for protocol
//! packets; data streams are numbered from 1. A zero-length frame closes its
//! channel.

use crate::error::DriverError;

/// Channel id reserved for protocol packets.
pub const PACKET_CHANNEL: u32 = 0;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload.
///
/// Relay chunks are far smaller; the bound exists so a corrupt or hostile
/// header cannot make the decoder reserve unbounded memory.
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024;

/// A decoded channel frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// The channel the payload belongs to.
    pub channel: u32,
    /// Payload bytes; empty means the sender closed the channel.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Returns `true` when this frame closes its channel.
    #[must_use]
    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encodes one frame into `out`.
pub fn encode_frame_into(out: &mut Vec<u8>, channel: u32, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Encodes one frame into a fresh buffer.
#[must_use]
pub fn encode_frame(channel: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_frame_into(&mut out, channel, payload);
    out
}

/// Incremental frame decoder.
///
/// Bytes are appended as they arrive off the wire; [`FrameDecoder::next_frame`]
/// yields complete frames regardless of how the byte stream was split across
/// reads. Consumed bytes are compacted lazily to keep the buffer bounded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.consumed > 0 && self.consumed == self.buf.len() {
            self.buf.clear();
            self.consumed = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the number of buffered, not-yet-decoded bytes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Decodes the next complete frame, if the buffer holds one.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::OversizedFrame`] when a header announces a
    /// payload larger than [`MAX_FRAME_PAYLOAD`]; the decoder is then
    /// unusable for the connection, which must be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DriverError> {
        let pending = &self.buf[self.consumed..];
        if pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let channel = u32::from_be_bytes(pending[..4].try_into().expect("4-byte slice"));
        let len = u32::from_be_bytes(pending[4..8].try_into().expect("4-byte slice")) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(DriverError::OversizedFrame {
                len,
                limit: MAX_FRAME_PAYLOAD,
            });
        }
        if pending.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = pending[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.consumed += HEADER_LEN + len;

        // Compact once more than half the buffer is dead weight.
        if self.consumed * 2 > self.buf.len() {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }

        Ok(Some(Frame { channel, payload }))
    }
}
