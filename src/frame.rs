//! Multiplex wire format.
//!
//! A frame is `pad14(len) || channel_id || data`: a 14-character ASCII
//! decimal payload length, zero-padded on the left, followed by the
//! payload whose first 36 bytes are the channel id and whose remainder is
//! opaque stream data. Channel ids are UUIDs in canonical hyphenated text
//! form, which is exactly 36 ASCII bytes.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::TunnelError;

/// Width of the zero-padded decimal length prefix.
pub const LENGTH_PREFIX_LEN: usize = 14;

/// Channel ids are the canonical text form of a UUID: always 36 bytes.
pub const CHANNEL_ID_LEN: usize = 36;

/// Identifier of one logical stream inside the multiplex protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; CHANNEL_ID_LEN]);

impl ChannelId {
    /// A fresh identifier. UUID v4 makes collisions within a client's
    /// lifetime a non-concern.
    pub fn random() -> Self {
        let mut bytes = [0u8; CHANNEL_ID_LEN];
        Uuid::new_v4().as_hyphenated().encode_lower(&mut bytes);
        Self(bytes)
    }

    /// Reconstruct an id from its 36 wire bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; CHANNEL_ID_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CHANNEL_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", String::from_utf8_lossy(&self.0))
    }
}

/// One decoded unit of the multiplex protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: ChannelId,
    pub data: Bytes,
}

impl Frame {
    pub fn new(channel: ChannelId, data: impl Into<Bytes>) -> Self {
        Self {
            channel,
            data: data.into(),
        }
    }

    /// Encode as `pad14(len) || channel_id || data`.
    pub fn encode(&self) -> Bytes {
        let payload_len = CHANNEL_ID_LEN + self.data.len();
        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload_len);
        out.extend_from_slice(format!("{:014}", payload_len).as_bytes());
        out.extend_from_slice(self.channel.as_bytes());
        out.extend_from_slice(&self.data);
        out.freeze()
    }
}

/// Decoding failure that cannot be skipped over.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix was not 14 ASCII decimal digits. The stream
    /// offset is lost at this point, so decoding stops without consuming
    /// the offending bytes.
    #[error("frame length prefix is not {LENGTH_PREFIX_LEN} decimal digits")]
    BadLengthPrefix,
}

/// Incremental frame decoder over a growing receive buffer.
///
/// Frames are taken off the front as they complete; a partial length
/// prefix or partial payload stays buffered until more bytes arrive. A
/// payload too short to carry a channel id is logged and skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame. `Ok(None)` means more bytes are
    /// needed; once [`FrameError::BadLengthPrefix`] is returned the
    /// decoder stays in that state.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if self.poisoned {
                return Err(FrameError::BadLengthPrefix);
            }
            if self.buf.len() < LENGTH_PREFIX_LEN {
                return Ok(None);
            }
            let Some(payload_len) = parse_length_prefix(&self.buf[..LENGTH_PREFIX_LEN]) else {
                self.poisoned = true;
                return Err(FrameError::BadLengthPrefix);
            };
            if self.buf.len() < LENGTH_PREFIX_LEN + payload_len {
                return Ok(None);
            }
            if payload_len < CHANNEL_ID_LEN {
                log::warn!(
                    "{}",
                    TunnelError::Protocol(format!(
                        "skipping malformed frame: {} payload bytes cannot carry a channel id",
                        payload_len
                    ))
                );
                self.buf.advance(LENGTH_PREFIX_LEN + payload_len);
                continue;
            }
            self.buf.advance(LENGTH_PREFIX_LEN);
            let mut payload = self.buf.split_to(payload_len);
            let data = payload.split_off(CHANNEL_ID_LEN);
            let channel =
                ChannelId::from_slice(&payload).expect("payload length checked above");
            return Ok(Some(Frame {
                channel,
                data: data.freeze(),
            }));
        }
    }
}

fn parse_length_prefix(digits: &[u8]) -> Option<usize> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    // All-digit input of fixed width cannot fail to parse; the type bound
    // is what matters.
    std::str::from_utf8(digits).ok()?.parse::<usize>().ok()
}
