//! Receive intents: buffers one side offers so the other has somewhere to write.
//!
//! Local intents own their buffer and are filled by inbound data frames.
//! Remote intents only describe buffer space the peer offered; a send claims
//! one before any data frame goes out.

use bytes::Bytes;

use crate::protocol::IntentDescriptor;

use super::error::{Error, Result};
use super::ids::IdMap;

/// A buffer this side offered to the peer.
#[derive(Debug)]
pub(crate) struct LocalIntent {
    size: usize,
    data: Vec<u8>,
    reuse: bool,
    advertised: bool,
}

impl LocalIntent {
    /// Allocate the backing buffer up front, reporting failure instead of aborting.
    pub(crate) fn allocate(size: usize, reuse: bool) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory { size })?;
        Ok(Self {
            size,
            data,
            reuse,
            advertised: false,
        })
    }

    /// Reassembly offset.
    pub(crate) fn offset(&self) -> usize {
        self.data.len()
    }

    fn descriptor(&self, id: u32) -> IntentDescriptor {
        IntentDescriptor {
            size: u32::try_from(self.size).unwrap_or(u32::MAX),
            id,
            addr: 0,
        }
    }

    fn take_message(&mut self) -> Bytes {
        if self.reuse {
            let message = Bytes::copy_from_slice(&self.data);
            self.data.clear();
            message
        } else {
            Bytes::from(std::mem::take(&mut self.data))
        }
    }
}

/// A buffer the peer offered to this side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteIntent {
    size: usize,
    addr: u64,
    offset: usize,
    in_use: bool,
}

/// Remote intent reserved for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClaimedIntent {
    pub(crate) id: u32,
    pub(crate) size: usize,
    pub(crate) addr: u64,
    pub(crate) offset: usize,
}

/// Fully reassembled inbound message.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) iid: u32,
    pub(crate) reuse: bool,
    pub(crate) message: Bytes,
}

/// Why an inbound data frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveError {
    UnknownIntent,
    Overflow {
        size: usize,
        offset: usize,
        chunk: usize,
    },
}

/// Both intent populations of one channel.
#[derive(Debug)]
pub(crate) struct IntentTables {
    local: IdMap<LocalIntent>,
    remote: IdMap<RemoteIntent>,
}

impl Default for IntentTables {
    fn default() -> Self {
        Self {
            local: IdMap::new(1, u32::MAX),
            remote: IdMap::new(0, u32::MAX),
        }
    }
}

impl IntentTables {
    /// Add a freshly allocated local intent and return its id.
    pub(crate) fn insert_local(&mut self, intent: LocalIntent) -> Result<u32> {
        self.local
            .alloc_cyclic(intent)
            .map_err(|intent| Error::OutOfMemory { size: intent.size })
    }

    /// Mark a local intent advertised. `None` if it already was, or is gone.
    pub(crate) fn take_advertisement(&mut self, id: u32) -> Option<IntentDescriptor> {
        let intent = self.local.get_mut(id)?;
        if intent.advertised {
            return None;
        }
        intent.advertised = true;
        Some(intent.descriptor(id))
    }

    /// Mark every not-yet-advertised local intent advertised.
    pub(crate) fn take_pending_advertisements(&mut self) -> Vec<IntentDescriptor> {
        self.local
            .iter_mut()
            .filter(|(_, intent)| !intent.advertised)
            .map(|(id, intent)| {
                intent.advertised = true;
                intent.descriptor(id)
            })
            .collect()
    }

    /// Throw away a partial message left in a local intent.
    ///
    /// Returns the number of bytes dropped. Called when a frame that starts
    /// a new message lands on an intent that is still mid-reassembly.
    pub(crate) fn discard_partial(&mut self, iid: u32) -> usize {
        match self.local.get_mut(iid) {
            Some(intent) => {
                let stale = intent.data.len();
                intent.data.clear();
                stale
            }
            None => 0,
        }
    }

    /// Write a data frame into the addressed local intent.
    ///
    /// The frame is rejected, and the intent left untouched, if it would
    /// run past the intent's size. Once `left_size` reaches zero the
    /// assembled message is returned and the intent is released or reset.
    pub(crate) fn receive(
        &mut self,
        iid: u32,
        payload: &[u8],
        left_size: u32,
    ) -> std::result::Result<Option<Delivery>, ReceiveError> {
        let intent = self.local.get_mut(iid).ok_or(ReceiveError::UnknownIntent)?;
        let offset = intent.offset();
        if intent.size - offset < payload.len() {
            return Err(ReceiveError::Overflow {
                size: intent.size,
                offset,
                chunk: payload.len(),
            });
        }
        intent.data.extend_from_slice(payload);
        if left_size != 0 {
            return Ok(None);
        }

        let reuse = intent.reuse;
        let message = intent.take_message();
        if !reuse {
            self.local.remove(iid);
        }
        Ok(Some(Delivery {
            iid,
            reuse,
            message,
        }))
    }

    /// Record an intent advertised by the peer. `false` if the id is taken.
    pub(crate) fn add_remote(&mut self, descriptor: IntentDescriptor) -> bool {
        let intent = RemoteIntent {
            size: descriptor.size as usize,
            addr: descriptor.addr,
            offset: 0,
            in_use: false,
        };
        self.remote.insert_at(descriptor.id, intent).is_ok()
    }

    /// Claim the smallest free remote intent that can hold `len` bytes.
    ///
    /// Ties go to the lowest id; an exact fit ends the scan early.
    pub(crate) fn claim_best_fit(&mut self, len: usize) -> Option<ClaimedIntent> {
        let mut best: Option<(u32, usize)> = None;
        for (id, intent) in self.remote.iter() {
            if intent.in_use || intent.size < len {
                continue;
            }
            if best.is_none_or(|(_, size)| intent.size < size) {
                best = Some((id, intent.size));
                if intent.size == len {
                    break;
                }
            }
        }

        let (id, _) = best?;
        let intent = self.remote.get_mut(id)?;
        intent.in_use = true;
        Some(ClaimedIntent {
            id,
            size: intent.size,
            addr: intent.addr,
            offset: intent.offset,
        })
    }

    /// Return a claimed intent after a failed send.
    pub(crate) fn release_remote(&mut self, id: u32) {
        if let Some(intent) = self.remote.get_mut(id) {
            intent.in_use = false;
            intent.offset = 0;
        }
    }

    /// Drop a claimed intent after part of a message reached the peer.
    ///
    /// The peer's buffer holds an unfinished message, so the id is never
    /// used again.
    pub(crate) fn retire_remote(&mut self, id: u32) -> bool {
        self.remote.remove(id).is_some()
    }

    /// Account for chunk bytes about to be written into a claimed intent.
    pub(crate) fn advance_remote(&mut self, id: u32, written: usize) {
        if let Some(intent) = self.remote.get_mut(id) {
            intent.offset += written;
        }
    }

    /// Handle RX_DONE from the peer. `false` if the intent is unknown.
    pub(crate) fn remote_done(&mut self, id: u32, reuse: bool) -> bool {
        if reuse {
            match self.remote.get_mut(id) {
                Some(intent) => {
                    intent.offset = 0;
                    intent.in_use = false;
                    true
                }
                None => false,
            }
        } else {
            self.remote.remove(id).is_some()
        }
    }

    pub(crate) fn local_count(&self) -> usize {
        self.local.len()
    }

    pub(crate) fn remote_count(&self) -> usize {
        self.remote.len()
    }
}
