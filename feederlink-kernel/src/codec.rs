//! Binary command frames exchanged with the feeder over the local link.
//!
//! Every frame is 13 bytes: class, opcode, payload, trailing checksum.
//!
//! ```text
//!  0      1      2        3         4..11      12
//! [0x01] [op]  [lo]     [hi]      reserved   [sum(0..12) & 0xFF]
//! ```
//!
//! The feed layout is the one the device firmware accepts. The status layout
//! is provisional: the vendor never documented it, so `decode_status` and
//! `encode_status` are the only two places to touch once it is known.

use time::OffsetDateTime;

use crate::error::CodecError;
use crate::models::StatusSnapshot;

pub const FRAME_LEN: usize = 13;
pub const CLASS_DEVICE: u8 = 0x01;
pub const OP_STATUS: u8 = 0x01;
pub const OP_FEED: u8 = 0x02;

pub const MIN_FEED_GRAMS: u16 = 1;
pub const MAX_FEED_GRAMS: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; FRAME_LEN]);

impl CommandFrame {
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[1]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Grams carried by a feed frame; `None` for any other opcode.
    pub fn feed_amount(&self) -> Option<u16> {
        (self.opcode() == OP_FEED).then(|| u16::from_le_bytes([self.0[2], self.0[3]]))
    }

    /// Build a frame from its 12 leading bytes, appending the checksum.
    fn seal(mut body: [u8; FRAME_LEN]) -> Self {
        body[FRAME_LEN - 1] = checksum(&body[..FRAME_LEN - 1]);
        Self(body)
    }
}

impl AsRef<[u8]> for CommandFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn encode_feed(amount: u16) -> Result<CommandFrame, CodecError> {
    if !(MIN_FEED_GRAMS..=MAX_FEED_GRAMS).contains(&amount) {
        return Err(CodecError::InvalidAmount(i64::from(amount)));
    }
    let [lo, hi] = amount.to_le_bytes();
    let mut body = [0u8; FRAME_LEN];
    body[0] = CLASS_DEVICE;
    body[1] = OP_FEED;
    body[2] = lo;
    // Zero for every amount up to 255, which keeps the historic layout.
    body[3] = hi;
    Ok(CommandFrame::seal(body))
}

pub fn encode_status(battery: u8, food_level: u8) -> CommandFrame {
    let mut body = [0u8; FRAME_LEN];
    body[0] = CLASS_DEVICE;
    body[1] = OP_STATUS;
    body[2] = battery;
    body[3] = food_level;
    CommandFrame::seal(body)
}

pub fn decode_status(bytes: &[u8], received_at: OffsetDateTime) -> Result<StatusSnapshot, CodecError> {
    if bytes.len() != FRAME_LEN {
        return Err(CodecError::FrameCorrupt(format!(
            "expected {FRAME_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let expected = checksum(&bytes[..FRAME_LEN - 1]);
    let actual = bytes[FRAME_LEN - 1];
    if expected != actual {
        return Err(CodecError::FrameCorrupt(format!(
            "checksum mismatch: expected {expected:#04x}, got {actual:#04x}"
        )));
    }
    if bytes[0] != CLASS_DEVICE || bytes[1] != OP_STATUS {
        return Err(CodecError::FrameCorrupt(format!(
            "not a status frame (class {:#04x}, op {:#04x})",
            bytes[0], bytes[1]
        )));
    }
    let (battery, food_level) = (bytes[2], bytes[3]);
    if battery > 100 || food_level > 100 {
        return Err(CodecError::FrameCorrupt(format!(
            "percentage out of range (battery {battery}, food {food_level})"
        )));
    }
    Ok(StatusSnapshot::online(battery, food_level, received_at))
}
