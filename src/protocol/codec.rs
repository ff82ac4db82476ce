//! Inbound frame decoding and outbound message planning
//!
//! Every declared length is checked against the bytes actually left in the
//! buffer before anything is copied or allocated.

use bytes::Bytes;

use super::{
    CHUNK_ALIGNMENT, CHUNK_DESCRIPTOR_SIZE, CommandHeader, DataChunk, DecodeError,
    FRAME_ALIGNMENT, Features, Frame, HEADER_SIZE, INTENT_RECORD_SIZE, IntentDescriptor, NAME_MAX,
    Opcode, SHORT_DATA_SIZE, align_up,
};

/// Walks an inbound buffer frame by frame.
///
/// A malformed frame yields one `Err` and the walk resumes at the next frame
/// boundary. A truncated frame yields `Err` and ends the walk.
#[derive(Debug, Clone)]
pub struct FrameIter {
    buf: Bytes,
    offset: usize,
}

impl FrameIter {
    /// Start walking `buf` from the beginning
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn le_u32(&self, at: usize) -> u32 {
        let raw = &self.buf[at..at + 4];
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn le_u64(&self, at: usize) -> u64 {
        u64::from(self.le_u32(at)) | (u64::from(self.le_u32(at + 4)) << 32)
    }

    /// Decode one frame at the cursor.
    ///
    /// Returns the result together with the stride to advance, or `None` as
    /// the stride when the rest of the buffer can no longer be trusted.
    fn decode_one(&self) -> (Result<Frame, DecodeError>, Option<usize>) {
        let available = self.remaining();
        let Some(header) = CommandHeader::from_bytes(&self.buf[self.offset..]) else {
            return (
                Err(DecodeError::Truncated {
                    what: "header",
                    needed: HEADER_SIZE,
                    available,
                }),
                None,
            );
        };
        let body = self.offset + HEADER_SIZE;
        let body_len = available - HEADER_SIZE;

        let Some(opcode) = header.opcode() else {
            return (
                Err(DecodeError::UnknownOpcode { opcode: header.cmd }),
                Some(HEADER_SIZE),
            );
        };

        let cid = header.param1;
        let trailing = |len: usize| HEADER_SIZE + align_up(len, FRAME_ALIGNMENT);
        let truncated = |what: &'static str,
                         needed: usize|
         -> (Result<Frame, DecodeError>, Option<usize>) {
            (
                Err(DecodeError::Truncated {
                    what,
                    needed,
                    available: body_len,
                }),
                None,
            )
        };

        match opcode {
            Opcode::Version | Opcode::VersionAck => {
                let version = header.param1;
                let features = Features::from_bits(header.param2);
                let frame = if opcode == Opcode::Version {
                    Frame::Version { version, features }
                } else {
                    Frame::VersionAck { version, features }
                };
                (Ok(frame), Some(HEADER_SIZE))
            }
            Opcode::Open => {
                let name_len = (header.param2 & 0xffff) as usize;
                let padded = align_up(name_len, FRAME_ALIGNMENT);
                if padded > body_len {
                    return truncated("channel name", padded);
                }
                let raw = &self.buf[body..body + name_len];
                (decode_name(raw).map(|name| Frame::Open { cid, name }), Some(trailing(name_len)))
            }
            Opcode::Close => (Ok(Frame::Close { cid }), Some(HEADER_SIZE)),
            Opcode::OpenAck => (Ok(Frame::OpenAck { cid }), Some(HEADER_SIZE)),
            Opcode::CloseAck => (Ok(Frame::CloseAck { cid }), Some(HEADER_SIZE)),
            Opcode::Intent => {
                let count = header.param2 as usize;
                let needed = count.checked_mul(INTENT_RECORD_SIZE).unwrap_or(usize::MAX);
                if needed > body_len {
                    return truncated("intent records", needed);
                }
                let intents = (0..count)
                    .map(|i| {
                        let at = body + i * INTENT_RECORD_SIZE;
                        IntentDescriptor {
                            size: self.le_u32(at),
                            id: self.le_u32(at + 4),
                            addr: self.le_u64(at + 8),
                        }
                    })
                    .collect();
                (Ok(Frame::Intent { cid, intents }), Some(trailing(needed)))
            }
            Opcode::RxDone | Opcode::RxDoneWithReuse => (
                Ok(Frame::RxDone {
                    cid,
                    iid: header.param2,
                    reuse: opcode == Opcode::RxDoneWithReuse,
                }),
                Some(HEADER_SIZE),
            ),
            Opcode::IntentRequest => (
                Ok(Frame::IntentRequest {
                    cid,
                    size: header.param2,
                }),
                Some(HEADER_SIZE),
            ),
            Opcode::IntentRequestAck => (
                Ok(Frame::IntentRequestAck {
                    cid,
                    granted: header.param2 != 0,
                }),
                Some(HEADER_SIZE),
            ),
            Opcode::TxData | Opcode::TxDataCont => {
                if body_len < CHUNK_DESCRIPTOR_SIZE {
                    return truncated("chunk descriptor", CHUNK_DESCRIPTOR_SIZE);
                }
                let chunk_size = self.le_u32(body) as usize;
                let needed = CHUNK_DESCRIPTOR_SIZE.saturating_add(chunk_size);
                if needed > body_len {
                    return truncated("chunk payload", needed);
                }
                let start = body + CHUNK_DESCRIPTOR_SIZE;
                let chunk = DataChunk {
                    left_size: self.le_u32(body + 4),
                    addr: self.le_u64(body + 8),
                    payload: self.buf.slice(start..start + chunk_size),
                };
                (
                    Ok(Frame::TxData {
                        cid,
                        iid: header.param2,
                        cont: opcode == Opcode::TxDataCont,
                        chunk,
                    }),
                    Some(trailing(needed)),
                )
            }
            Opcode::ReadNotify => (Ok(Frame::ReadNotify), Some(HEADER_SIZE)),
            Opcode::Signals => (
                Ok(Frame::Signals {
                    cid,
                    native: header.param2,
                }),
                Some(HEADER_SIZE),
            ),
            Opcode::TxShortData => {
                if body_len < SHORT_DATA_SIZE {
                    return truncated("short payload", SHORT_DATA_SIZE);
                }
                let stride = Some(trailing(SHORT_DATA_SIZE));
                let size = header.param3 as usize;
                if size > SHORT_DATA_SIZE {
                    return (
                        Err(DecodeError::ShortDataTooLong {
                            size: header.param3,
                            max: SHORT_DATA_SIZE,
                        }),
                        stride,
                    );
                }
                (
                    Ok(Frame::TxShortData {
                        cid,
                        iid: header.param2,
                        left_size: header.param4,
                        payload: self.buf.slice(body..body + size),
                    }),
                    stride,
                )
            }
        }
    }
}

impl Iterator for FrameIter {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let (result, stride) = self.decode_one();
        match stride {
            Some(stride) => self.offset = (self.offset + stride).min(self.buf.len()),
            None => self.offset = self.buf.len(),
        }
        Some(result)
    }
}

fn decode_name(raw: &[u8]) -> Result<String, DecodeError> {
    if raw.len() > NAME_MAX {
        return Err(DecodeError::InvalidName {
            reason: "longer than the wire maximum",
        });
    }
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if end == 0 {
        return Err(DecodeError::InvalidName { reason: "empty" });
    }
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidName {
            reason: "not valid UTF-8",
        })
}

/// How a message of a given length is laid out across data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSplit {
    /// Bytes carried by TX_DATA / TX_DATA_CONT frames
    pub chunk: usize,
    /// Bytes carried by the trailing TX_SHORT_DATA frame
    pub short: usize,
}

/// Split a message into its bulk chunk and short tail.
///
/// Up to [`SHORT_DATA_SIZE`] bytes travel in a single short frame. Longer
/// messages that are a multiple of [`CHUNK_ALIGNMENT`] travel entirely as
/// chunk data; otherwise the chunk covers `align_up(len - 16, 4)` bytes and
/// the short frame carries the rest.
#[must_use]
pub const fn split_message(len: usize) -> MessageSplit {
    let chunk = if len <= SHORT_DATA_SIZE {
        0
    } else if len % CHUNK_ALIGNMENT == 0 {
        len
    } else {
        align_up(len - SHORT_DATA_SIZE, CHUNK_ALIGNMENT)
    };
    MessageSplit {
        chunk,
        short: len - chunk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode_all(frames: &[Frame]) -> Bytes {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }
        buf.freeze()
    }

    #[test]
    fn frames_roundtrip_through_one_buffer() {
        let frames = vec![
            Frame::Version {
                version: 1,
                features: Features::SUPPORTED,
            },
            Frame::Open {
                cid: 7,
                name: "diag".to_owned(),
            },
            Frame::Intent {
                cid: 7,
                intents: vec![
                    IntentDescriptor {
                        size: 1024,
                        id: 1,
                        addr: 0,
                    },
                    IntentDescriptor {
                        size: 64,
                        id: 2,
                        addr: 0xdead_beef_0000,
                    },
                ],
            },
            Frame::TxData {
                cid: 7,
                iid: 1,
                cont: true,
                chunk: DataChunk {
                    left_size: 5,
                    addr: 64,
                    payload: Bytes::from(vec![1u8; 33]),
                },
            },
            Frame::TxShortData {
                cid: 7,
                iid: 1,
                left_size: 0,
                payload: Bytes::from_static(b"tail!"),
            },
            Frame::ReadNotify,
        ];
        let decoded: Vec<_> = FrameIter::new(encode_all(&frames))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn unknown_opcode_skips_one_header() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CommandHeader {
            cmd: 15,
            ..CommandHeader::default()
        }
        .to_bytes());
        Frame::Close { cid: 4 }.encode(&mut buf);

        let mut iter = FrameIter::new(buf.freeze());
        assert_eq!(
            iter.next(),
            Some(Err(DecodeError::UnknownOpcode { opcode: 15 }))
        );
        assert_eq!(iter.next(), Some(Ok(Frame::Close { cid: 4 })));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn oversized_intent_count_stops_the_walk() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CommandHeader::new(Opcode::Intent, 1, u32::MAX).to_bytes());
        Frame::ReadNotify.encode(&mut buf);

        let mut iter = FrameIter::new(buf.freeze());
        assert!(matches!(iter.next(), Some(Err(DecodeError::Truncated { .. }))));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn chunk_larger_than_buffer_is_truncated() {
        let mut bytes = Frame::TxData {
            cid: 1,
            iid: 1,
            cont: false,
            chunk: DataChunk {
                left_size: 0,
                addr: 0,
                payload: Bytes::from(vec![0u8; 8]),
            },
        }
        .to_bytes()
        .to_vec();
        bytes[16..20].copy_from_slice(&4096u32.to_le_bytes());

        let mut iter = FrameIter::new(Bytes::from(bytes));
        assert!(matches!(
            iter.next(),
            Some(Err(DecodeError::Truncated {
                what: "chunk payload",
                ..
            }))
        ));
    }

    #[test]
    fn bad_name_is_skipped_without_losing_sync() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CommandHeader::new(Opcode::Open, 2, 16).to_bytes());
        buf.extend_from_slice(&[0xff; 16]);
        Frame::OpenAck { cid: 2 }.encode(&mut buf);

        let mut iter = FrameIter::new(buf.freeze());
        assert!(matches!(
            iter.next(),
            Some(Err(DecodeError::InvalidName { .. }))
        ));
        assert_eq!(iter.next(), Some(Ok(Frame::OpenAck { cid: 2 })));
    }

    #[test]
    fn oversized_short_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            &CommandHeader {
                param3: 40,
                ..CommandHeader::new(Opcode::TxShortData, 1, 1)
            }
            .to_bytes(),
        );
        buf.extend_from_slice(&[0u8; 16]);
        Frame::ReadNotify.encode(&mut buf);

        let mut iter = FrameIter::new(buf.freeze());
        assert!(matches!(
            iter.next(),
            Some(Err(DecodeError::ShortDataTooLong { size: 40, .. }))
        ));
        assert_eq!(iter.next(), Some(Ok(Frame::ReadNotify)));
    }

    #[test]
    fn split_follows_short_and_alignment_rules() {
        assert_eq!(split_message(1), MessageSplit { chunk: 0, short: 1 });
        assert_eq!(split_message(16), MessageSplit { chunk: 0, short: 16 });
        assert_eq!(split_message(20), MessageSplit { chunk: 20, short: 0 });
        assert_eq!(split_message(21), MessageSplit { chunk: 8, short: 13 });
        assert_eq!(split_message(1023), MessageSplit { chunk: 1008, short: 15 });
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: arbitrary bytes never panic the decoder and the walk terminates
            #[test]
            fn prop_decoder_survives_garbage(raw in prop::collection::vec(any::<u8>(), 0..512)) {
                let len = raw.len();
                let frames = FrameIter::new(Bytes::from(raw)).take(len + 1).count();
                prop_assert!(frames <= len / HEADER_SIZE + 1);
            }

            /// Property: the short tail is always smaller than a frame stride
            #[test]
            fn prop_split_tail_is_short(len in 1usize..65_536) {
                let split = split_message(len);
                prop_assert_eq!(split.chunk + split.short, len);
                prop_assert!(split.short <= SHORT_DATA_SIZE);
                prop_assert_eq!(split.chunk % CHUNK_ALIGNMENT, 0);
                if len > SHORT_DATA_SIZE {
                    prop_assert!(split.short < FRAME_ALIGNMENT);
                }
            }
        }
    }
}
