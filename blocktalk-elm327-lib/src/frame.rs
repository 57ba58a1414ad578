//! CAN frames as printed by an ELM327 with headers (`ATH1`) and DLC (`ATD1`) on.
//!
//! A frame line looks like `300 6 A1 0F 8A FF 4A FF`: three hex digits of
//! 11-bit identifier, one hex digit of data length, then the payload bytes.
//! Spaces are optional (`ATS0` removes them).

use derive_more::{Display, Error};
use smallvec::SmallVec;

/// Maximum payload of a classic CAN frame.
pub const MAX_FRAME_LEN: usize = 8;

/// Highest 11-bit identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Inline storage for a frame payload (never spills to the heap).
pub type FrameData = SmallVec<u8, MAX_FRAME_LEN>;

/// Reasons a line could not be decoded as a CAN frame.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum FrameError {
    #[display("line too short for a frame: {line:?}")]
    TooShort { line: String },
    #[display("non-hex characters in frame line: {line:?}")]
    InvalidHex { line: String },
    #[display("odd number of payload digits in {line:?}")]
    OddPayload { line: String },
    #[display("declared length {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[display("declared length {declared} exceeds 8 bytes")]
    TooLong { declared: usize },
}

/// A single received (or simulated) CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    data: FrameData,
}

impl CanFrame {
    /// Build a frame, returning `None` if the id is wider than 11 bits or the
    /// payload is longer than 8 bytes.
    pub fn new(id: u16, data: &[u8]) -> Option<Self> {
        if id > MAX_STANDARD_ID || data.len() > MAX_FRAME_LEN {
            return None;
        }
        Some(Self {
            id,
            data: data.iter().copied().collect(),
        })
    }

    /// Decode one adapter output line.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] unless the line holds exactly three id digits,
    /// one length digit of at most 8, and `2 * length` payload digits.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < 4 {
            return Err(FrameError::TooShort { line: line.to_string() });
        }
        if !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FrameError::InvalidHex { line: line.to_string() });
        }

        // All ASCII from here on, so byte slicing is safe
        let id = u16::from_str_radix(&compact[..3], 16)
            .map_err(|_| FrameError::InvalidHex { line: line.to_string() })?;
        let declared = usize::from_str_radix(&compact[3..4], 16)
            .map_err(|_| FrameError::InvalidHex { line: line.to_string() })?;
        if declared > MAX_FRAME_LEN {
            return Err(FrameError::TooLong { declared });
        }

        let payload = &compact[4..];
        if payload.len() % 2 != 0 {
            return Err(FrameError::OddPayload { line: line.to_string() });
        }
        let bytes = hex::decode(payload).map_err(|_| FrameError::InvalidHex { line: line.to_string() })?;
        if bytes.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            id,
            data: bytes.into_iter().collect(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// High nibble of the first payload byte (the TP 2.0 opcode), if any.
    pub fn opcode(&self) -> Option<u8> {
        self.data.first().map(|b| b >> 4)
    }

    /// Render the frame the way an adapter prints it.
    pub fn to_line(&self, headers: bool, dlc: bool, spaces: bool) -> String {
        let sep = if spaces { " " } else { "" };
        let mut parts: Vec<String> = Vec::with_capacity(self.data.len() + 2);
        if headers {
            parts.push(format!("{:03X}", self.id));
        }
        if dlc {
            parts.push(format!("{:X}", self.data.len()));
        }
        parts.extend(self.data.iter().map(|b| format!("{b:02X}")));
        parts.join(sep)
    }
}

/// Render bytes as space-separated upper-case hex, ready to send to the adapter.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
