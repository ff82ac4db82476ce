//! Decoder error types

use thiserror::Error;

/// Errors raised while walking an inbound frame buffer.
///
/// `Truncated` ends the walk because the next frame boundary is unknown.
/// Every other variant is skipped by the frame's declared stride and the
/// walk continues with the following frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Declared frame length exceeds the bytes left in the buffer
    #[error("truncated {what}: need {needed} bytes, got {available}")]
    Truncated {
        /// Part of the frame being read
        what: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Opcode not known to this implementation
    #[error("unknown opcode: {opcode}")]
    UnknownOpcode {
        /// Raw opcode value
        opcode: u16,
    },

    /// OPEN frame carried an unusable channel name
    #[error("invalid channel name ({reason})")]
    InvalidName {
        /// Why the name was rejected
        reason: &'static str,
    },

    /// Short data frame declared more payload than it can carry
    #[error("short data frame declares {size} bytes (max {max})")]
    ShortDataTooLong {
        /// Declared size
        size: u32,
        /// Inline capacity
        max: usize,
    },
}
