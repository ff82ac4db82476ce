//! Application-facing channel handle and the outbound message path.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{instrument, trace, warn};

use crate::protocol::{
    CHUNK_DESCRIPTOR_SIZE, DataChunk, FRAME_ALIGNMENT, Frame, HEADER_SIZE, SHORT_DATA_SIZE,
    Signals, WORD_SIZE, split_message,
};

use super::channel::{Channel, ChannelState};
use super::error::{Error, Operation, Result};
use super::intent::ClaimedIntent;
use super::metrics::IntentRequestOutcome;
use super::transport::{Transport, TransportInner};

/// An open channel.
///
/// Dropping the endpoint closes the channel; use [`Endpoint::close`] to
/// observe the outcome of the close handshake.
pub struct Endpoint {
    transport: Transport,
    channel: Arc<Channel>,
    closed: AtomicBool,
}

impl Endpoint {
    pub(super) fn new(transport: Transport, channel: Arc<Channel>) -> Self {
        Self {
            transport,
            channel,
            closed: AtomicBool::new(false),
        }
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Id this side assigned, while registered.
    #[must_use]
    pub fn local_id(&self) -> Option<u16> {
        Some(self.channel.lcid()).filter(|id| *id != 0)
    }

    /// Id the peer assigned, while registered.
    #[must_use]
    pub fn remote_id(&self) -> Option<u16> {
        Some(self.channel.rcid()).filter(|id| *id != 0)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Send one message, waiting for a remote intent and for credit.
    ///
    /// If no advertised intent fits, one is requested from the peer first.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.transport.inner.send_message(&self.channel, data, true)
    }

    /// Send one message only if an intent and credit are available now.
    ///
    /// Fails with [`Error::WouldBlock`] otherwise. The whole message must
    /// fit in a single credit reservation.
    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        self.transport.inner.send_message(&self.channel, data, false)
    }

    /// Signals last received from the peer.
    #[must_use]
    pub fn signals(&self) -> Signals {
        self.channel.remote_signals()
    }

    /// Signals this side last sent.
    #[must_use]
    pub fn local_signals(&self) -> Signals {
        self.channel.local_signals()
    }

    /// Set then clear bits in the local signal mask and send the result.
    pub fn set_signals(&self, set: u32, clear: u32) -> Result<()> {
        self.transport.inner.set_signals(&self.channel, set, clear)
    }

    /// Close the channel and wait for the peer to acknowledge.
    pub fn close(self) -> Result<()> {
        self.close_once()
    }

    fn close_once(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transport.inner.close_channel(&self.channel)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(err) = self.close_once() {
            warn!(channel = self.channel.name(), error = %err, "close on drop failed");
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("channel", &self.channel)
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl TransportInner {
    #[instrument(
        level = "trace",
        skip(self, channel, data),
        fields(channel = channel.name(), len = data.len())
    )]
    pub(super) fn send_message(&self, channel: &Arc<Channel>, data: &[u8], wait: bool) -> Result<()> {
        self.ensure_link_up()?;
        if data.is_empty() || data.len() > self.config.max_message_size {
            return Err(Error::MessageSize {
                len: data.len(),
                max: self.config.max_message_size,
            });
        }
        if channel.state() != ChannelState::Open || channel.remote_closed() {
            return Err(Error::ChannelClosed);
        }

        let claimed = self.claim_intent(channel, data.len(), wait)?;
        let result = self.send_fragments(channel, &claimed, data, wait);
        match &result {
            Ok(()) => {
                self.metrics.record_message_sent();
                trace!(iid = claimed.id, intent_size = claimed.size, "message sent");
            }
            Err(err) => {
                trace!(iid = claimed.id, error = %err, "send failed, releasing intent");
                // No-op when the intent was already retired.
                channel.intents.lock().release_remote(claimed.id);
            }
        }
        result
    }

    /// Best-fit claim, requesting a new intent from the peer when none fits.
    fn claim_intent(&self, channel: &Channel, len: usize, wait: bool) -> Result<ClaimedIntent> {
        loop {
            if let Some(claimed) = channel.intents.lock().claim_best_fit(len) {
                return Ok(claimed);
            }
            if !wait {
                return Err(Error::WouldBlock);
            }
            self.request_intent(channel, len)?;
            self.wait_for(
                &channel.intent_req.arrived,
                self.config.intent_request_timeout,
                Operation::IntentArrival,
            )?;
        }
    }

    /// Ask the peer for an intent of at least `len` bytes.
    fn request_intent(&self, channel: &Channel, len: usize) -> Result<()> {
        let sync = &channel.intent_req;
        let _serialised = sync.lock.lock();
        sync.acked.reinit();
        sync.arrived.reinit();
        sync.granted.store(false, Ordering::Release);

        let size = u32::try_from(len).map_err(|_| Error::MessageSize {
            len,
            max: self.config.max_message_size,
        })?;
        trace!(channel = channel.name(), size, "requesting intent");
        self.transmit(
            &[Frame::IntentRequest {
                cid: channel.lcid(),
                size,
            }],
            true,
        )?;
        self.metrics.record_intent_request(IntentRequestOutcome::Sent);

        self.wait_for(
            &sync.acked,
            self.config.intent_request_timeout,
            Operation::IntentRequest,
        )?;
        if sync.granted.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::IntentRejected { size: len })
        }
    }

    /// Largest TX_DATA payload that still leaves room for a trailing short
    /// frame inside one credit reservation.
    fn chunk_limit(&self) -> usize {
        let budget = (self.credit.max_reservation() * WORD_SIZE)
            .saturating_sub(HEADER_SIZE + CHUNK_DESCRIPTOR_SIZE + HEADER_SIZE + SHORT_DATA_SIZE);
        let budget = budget / FRAME_ALIGNMENT * FRAME_ALIGNMENT;
        self.config.max_chunk_size.min(budget)
    }

    /// Split `data` into frame groups and write them in order.
    ///
    /// The last chunk and the short tail go out under one reservation. If a
    /// later group fails after an earlier one was written, the intent is
    /// retired rather than released.
    fn send_fragments(
        &self,
        channel: &Channel,
        claimed: &ClaimedIntent,
        data: &[u8],
        wait: bool,
    ) -> Result<()> {
        let len = data.len();
        let split = split_message(len);
        let limit = self.chunk_limit();
        if split.chunk > 0 && limit == 0 {
            return Err(Error::MessageSize {
                len,
                max: SHORT_DATA_SIZE,
            });
        }

        let cid = channel.lcid();
        let mut groups: Vec<(usize, Vec<Frame>)> = Vec::new();
        let mut sent = 0;
        while sent < split.chunk {
            let take = (split.chunk - sent).min(limit);
            let offset = claimed.offset + sent;
            groups.push((
                take,
                vec![Frame::TxData {
                    cid,
                    iid: claimed.id,
                    cont: offset != 0,
                    chunk: DataChunk {
                        left_size: wire_len(len - sent - take),
                        addr: claimed.addr + offset as u64,
                        payload: Bytes::copy_from_slice(&data[sent..sent + take]),
                    },
                }],
            ));
            sent += take;
        }
        if split.short > 0 {
            let tail = Frame::TxShortData {
                cid,
                iid: claimed.id,
                left_size: 0,
                payload: Bytes::copy_from_slice(&data[split.chunk..]),
            };
            match groups.last_mut() {
                Some((_, frames)) => frames.push(tail),
                None => groups.push((0, vec![tail])),
            }
        }

        if !wait && groups.len() > 1 {
            let chunk: usize = groups.iter().map(|(bytes, _)| bytes).sum();
            let frames = groups.into_iter().flat_map(|(_, frames)| frames).collect();
            groups = vec![(chunk, frames)];
        }

        for (idx, (chunk_bytes, frames)) in groups.into_iter().enumerate() {
            channel.intents.lock().advance_remote(claimed.id, chunk_bytes);
            if let Err(err) = self.transmit(&frames, wait) {
                if idx > 0 {
                    // The peer holds the first part of this message.
                    warn!(iid = claimed.id, sent = idx, error = %err, "message cut short, retiring intent");
                    channel.intents.lock().retire_remote(claimed.id);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn set_signals(&self, channel: &Channel, set: u32, clear: u32) -> Result<()> {
        self.ensure_link_up()?;
        if channel.state() != ChannelState::Open {
            return Err(Error::ChannelClosed);
        }
        let signals = channel.local_signals().update(set, clear);
        channel.set_local_signals(signals);
        trace!(channel = channel.name(), %signals, "sending signals");
        self.transmit(
            &[Frame::Signals {
                cid: channel.lcid(),
                native: signals.to_native(),
            }],
            true,
        )
    }
}

fn wire_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
