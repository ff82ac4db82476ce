//! Wire format for the channel transport
//!
//! Every frame starts with a 16-byte command header and is padded to a
//! 16-byte boundary so names, intent records and payload walk a fixed stride.
//! This module performs no I/O; it only encodes and decodes bytes.

mod codec;
mod error;
mod frame;
mod header;
mod types;

pub use codec::{FrameIter, MessageSplit, split_message};
pub use error::DecodeError;
pub use frame::{DataChunk, Frame, IntentDescriptor};
pub use header::CommandHeader;
pub use types::{Features, Opcode, Signals};

/// Protocol version announced during negotiation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Command header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Every frame is padded to this many bytes.
pub const FRAME_ALIGNMENT: usize = 16;

/// Size of a FIFO word in bytes.
pub const WORD_SIZE: usize = 4;

/// Inline payload carried by a short data frame.
pub const SHORT_DATA_SIZE: usize = 16;

/// Alignment of the bulk chunk portion of a message.
pub const CHUNK_ALIGNMENT: usize = 4;

/// Maximum channel name length on the wire, including the NUL terminator.
pub const NAME_MAX: usize = 32;

/// Size of one advertised intent record inside an INTENT frame.
pub const INTENT_RECORD_SIZE: usize = 16;

/// Size of the chunk descriptor following a TX_DATA header.
pub const CHUNK_DESCRIPTOR_SIZE: usize = 16;

/// Round `len` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 4), 8);
    }
}
