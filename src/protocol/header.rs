//! Command header
//!
//! Every frame starts with the same 16-byte header.

use super::{HEADER_SIZE, Opcode};

/// Fixed command header (16 bytes, little-endian)
///
/// # Wire Format
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Command (2)          |           Param1 (2)          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Param2 (4)                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Param3 (4)                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Param4 (4)                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// Raw opcode
    pub cmd: u16,
    /// Usually a channel id
    pub param1: u16,
    /// Opcode specific
    pub param2: u32,
    /// Opcode specific
    pub param3: u32,
    /// Opcode specific
    pub param4: u32,
}

impl CommandHeader {
    /// Header with only the opcode and channel id populated
    #[must_use]
    pub const fn new(opcode: Opcode, param1: u16, param2: u32) -> Self {
        Self {
            cmd: opcode.as_u16(),
            param1,
            param2,
            param3: 0,
            param4: 0,
        }
    }

    /// Decoded opcode, if known
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.cmd)
    }

    /// Convert to bytes (little-endian)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..2].copy_from_slice(&self.cmd.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.param1.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.param2.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.param3.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.param4.to_le_bytes());

        bytes
    }

    /// Parse from bytes (little-endian)
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            cmd: u16::from_le_bytes([raw[0], raw[1]]),
            param1: u16::from_le_bytes([raw[2], raw[3]]),
            param2: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            param3: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            param4: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}
