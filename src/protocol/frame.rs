//! Closed set of command frames
//!
//! Inbound buffers are parsed into [`Frame`] values by
//! [`FrameIter`](super::FrameIter) and outbound frames are built with
//! [`Frame::encode`].

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    CHUNK_DESCRIPTOR_SIZE, CommandHeader, FRAME_ALIGNMENT, Features, HEADER_SIZE,
    INTENT_RECORD_SIZE, NAME_MAX, Opcode, SHORT_DATA_SIZE, align_up,
};

/// One advertised receive buffer inside an INTENT frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentDescriptor {
    /// Buffer size in bytes
    pub size: u32,
    /// Id assigned by the advertising side
    pub id: u32,
    /// Target address advertised for the buffer
    pub addr: u64,
}

/// Bulk portion of a message carried by TX_DATA and TX_DATA_CONT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    /// Bytes still to come after this chunk
    pub left_size: u32,
    /// Intent address plus the offset this chunk lands at
    pub addr: u64,
    /// Chunk bytes
    pub payload: Bytes,
}

/// Decoded command frame.
///
/// Channel ids are always the sender's local id except in `OpenAck` and
/// `CloseAck`, which echo the receiver's local id back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Version announcement
    Version {
        /// Announced version
        version: u16,
        /// Announced features
        features: Features,
    },
    /// Version acceptance
    VersionAck {
        /// Accepted version
        version: u16,
        /// Features the peer settled on
        features: Features,
    },
    /// Open request for a named channel
    Open {
        /// Sender's local channel id
        cid: u16,
        /// Channel name
        name: String,
    },
    /// Close request
    Close {
        /// Sender's local channel id
        cid: u16,
    },
    /// Open acknowledgement
    OpenAck {
        /// Receiver's local channel id
        cid: u16,
    },
    /// Close acknowledgement
    CloseAck {
        /// Receiver's local channel id
        cid: u16,
    },
    /// Receive intent advertisement
    Intent {
        /// Sender's local channel id
        cid: u16,
        /// Advertised buffers
        intents: Vec<IntentDescriptor>,
    },
    /// Receive completion for one intent
    RxDone {
        /// Sender's local channel id
        cid: u16,
        /// Intent id assigned by the sender of this frame
        iid: u32,
        /// Intent stays valid for another message
        reuse: bool,
    },
    /// Request for an intent of at least `size` bytes
    IntentRequest {
        /// Sender's local channel id
        cid: u16,
        /// Requested size in bytes
        size: u32,
    },
    /// Answer to an intent request
    IntentRequestAck {
        /// Sender's local channel id
        cid: u16,
        /// Whether an intent was allocated
        granted: bool,
    },
    /// Bulk chunk of a message
    TxData {
        /// Sender's local channel id
        cid: u16,
        /// Target intent id
        iid: u32,
        /// `true` for TX_DATA_CONT
        cont: bool,
        /// Descriptor and payload
        chunk: DataChunk,
    },
    /// Request for a free-space report
    ReadNotify,
    /// Signal update in native bit positions
    Signals {
        /// Sender's local channel id
        cid: u16,
        /// Native signal bits
        native: u32,
    },
    /// Short inline payload
    TxShortData {
        /// Sender's local channel id
        cid: u16,
        /// Target intent id
        iid: u32,
        /// Bytes still to come after this frame
        left_size: u32,
        /// Payload, at most [`SHORT_DATA_SIZE`] bytes
        payload: Bytes,
    },
}

impl Frame {
    /// Opcode this frame is encoded with
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Version { .. } => Opcode::Version,
            Self::VersionAck { .. } => Opcode::VersionAck,
            Self::Open { .. } => Opcode::Open,
            Self::Close { .. } => Opcode::Close,
            Self::OpenAck { .. } => Opcode::OpenAck,
            Self::CloseAck { .. } => Opcode::CloseAck,
            Self::Intent { .. } => Opcode::Intent,
            Self::RxDone { reuse: false, .. } => Opcode::RxDone,
            Self::RxDone { reuse: true, .. } => Opcode::RxDoneWithReuse,
            Self::IntentRequest { .. } => Opcode::IntentRequest,
            Self::IntentRequestAck { .. } => Opcode::IntentRequestAck,
            Self::TxData { cont: false, .. } => Opcode::TxData,
            Self::TxData { cont: true, .. } => Opcode::TxDataCont,
            Self::ReadNotify => Opcode::ReadNotify,
            Self::Signals { .. } => Opcode::Signals,
            Self::TxShortData { .. } => Opcode::TxShortData,
        }
    }

    /// Bytes this frame occupies on the wire, padding included
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let trailing = match self {
            Self::Open { name, .. } => wire_name(name).len() + 1,
            Self::Intent { intents, .. } => intents.len() * INTENT_RECORD_SIZE,
            Self::TxData { chunk, .. } => CHUNK_DESCRIPTOR_SIZE + chunk.payload.len(),
            Self::TxShortData { .. } => SHORT_DATA_SIZE,
            _ => 0,
        };
        HEADER_SIZE + align_up(trailing, FRAME_ALIGNMENT)
    }

    fn header(&self) -> CommandHeader {
        let opcode = self.opcode();
        match self {
            Self::Version { version, features } | Self::VersionAck { version, features } => {
                CommandHeader::new(opcode, *version, features.bits())
            }
            Self::Open { cid, name } => {
                let name_len = u32::try_from(wire_name(name).len() + 1).unwrap_or(0);
                CommandHeader::new(opcode, *cid, name_len)
            }
            Self::Close { cid } | Self::OpenAck { cid } | Self::CloseAck { cid } => {
                CommandHeader::new(opcode, *cid, 0)
            }
            Self::Intent { cid, intents } => {
                CommandHeader::new(opcode, *cid, u32::try_from(intents.len()).unwrap_or(0))
            }
            Self::RxDone { cid, iid, .. } => CommandHeader::new(opcode, *cid, *iid),
            Self::IntentRequest { cid, size } => CommandHeader::new(opcode, *cid, *size),
            Self::IntentRequestAck { cid, granted } => {
                CommandHeader::new(opcode, *cid, u32::from(*granted))
            }
            Self::TxData { cid, iid, .. } => CommandHeader::new(opcode, *cid, *iid),
            Self::ReadNotify => CommandHeader::new(opcode, 0, 0),
            Self::Signals { cid, native } => CommandHeader::new(opcode, *cid, *native),
            Self::TxShortData {
                cid,
                iid,
                left_size,
                payload,
            } => CommandHeader {
                param3: u32::try_from(payload.len()).unwrap_or(0),
                param4: *left_size,
                ..CommandHeader::new(opcode, *cid, *iid)
            },
        }
    }

    /// Append the encoded frame, padded to [`FRAME_ALIGNMENT`], to `dst`.
    ///
    /// Names are cut to `NAME_MAX - 1` bytes, on a character boundary, and
    /// short payloads to [`SHORT_DATA_SIZE`], so a frame never spills past
    /// its declared length.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(self.encoded_len());
        dst.put_slice(&self.header().to_bytes());

        match self {
            Self::Open { name, .. } => {
                dst.put_slice(wire_name(name).as_bytes());
                dst.put_u8(0);
            }
            Self::Intent { intents, .. } => {
                for intent in intents {
                    dst.put_u32_le(intent.size);
                    dst.put_u32_le(intent.id);
                    dst.put_u64_le(intent.addr);
                }
            }
            Self::TxData { chunk, .. } => {
                dst.put_u32_le(u32::try_from(chunk.payload.len()).unwrap_or(u32::MAX));
                dst.put_u32_le(chunk.left_size);
                dst.put_u64_le(chunk.addr);
                dst.put_slice(&chunk.payload);
            }
            Self::TxShortData { payload, .. } => {
                let take = payload.len().min(SHORT_DATA_SIZE);
                dst.put_slice(&payload[..take]);
                dst.put_bytes(0, SHORT_DATA_SIZE - take);
            }
            _ => {}
        }

        let written = dst.len() - start;
        dst.put_bytes(0, align_up(written, FRAME_ALIGNMENT) - written);
    }

    /// Encode into a fresh buffer
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Name as it goes on the wire, leaving room for the NUL terminator.
fn wire_name(name: &str) -> &str {
    let mut end = name.len().min(NAME_MAX - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_notify_is_one_header() {
        let bytes = Frame::ReadNotify.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[13, 0]);
    }

    #[test]
    fn open_name_is_nul_terminated_and_padded() {
        let frame = Frame::Open {
            cid: 3,
            name: "ping".to_owned(),
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 5);
        assert_eq!(&bytes[16..21], b"ping\0");
        assert!(bytes[21..].iter().all(|b| *b == 0));
    }

    #[test]
    fn overlong_open_name_is_cut_to_the_wire_maximum() {
        let frame = Frame::Open {
            cid: 1,
            name: "n".repeat(40),
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(bytes.len(), HEADER_SIZE + NAME_MAX);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            NAME_MAX as u32
        );
        assert_eq!(bytes[HEADER_SIZE + NAME_MAX - 1], 0);

        let decoded = crate::protocol::FrameIter::new(bytes).next().unwrap().unwrap();
        assert_eq!(
            decoded,
            Frame::Open {
                cid: 1,
                name: "n".repeat(NAME_MAX - 1),
            }
        );

        // Multi-byte characters are never split.
        assert_eq!(wire_name(&"\u{e9}".repeat(20)).len(), 30);
    }

    #[test]
    fn short_data_carries_size_and_left() {
        let frame = Frame::TxShortData {
            cid: 1,
            iid: 9,
            left_size: 0,
            payload: Bytes::from_static(b"hello"),
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + SHORT_DATA_SIZE);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 5);
        assert_eq!(&bytes[16..21], b"hello");
    }

    #[test]
    fn chunk_payload_is_inline_and_aligned() {
        let frame = Frame::TxData {
            cid: 2,
            iid: 4,
            cont: false,
            chunk: DataChunk {
                left_size: 3,
                addr: 0x1000,
                payload: Bytes::from(vec![0xAB; 20]),
            },
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(bytes.len(), HEADER_SIZE + 48);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 20);
        assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 3);
        assert_eq!(frame.opcode(), Opcode::TxData);
    }

    #[test]
    fn rx_done_reuse_selects_opcode() {
        let frame = Frame::RxDone {
            cid: 1,
            iid: 2,
            reuse: true,
        };
        assert_eq!(frame.opcode(), Opcode::RxDoneWithReuse);
        assert_eq!(frame.to_bytes()[0], 8);
    }
}
