//! Channel open and close handshakes, from both directions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::protocol::{Features, Frame, IntentDescriptor, NAME_MAX};

use super::channel::{Channel, ChannelCallbacks, ChannelState};
use super::error::{Error, Operation, Result};
use super::intent::LocalIntent;
use super::sync::{Completion, WaitError};
use super::transport::TransportInner;

/// Intent records carried by one INTENT frame.
const ADVERTISE_BATCH: usize = 4;

pub(super) fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() >= NAME_MAX {
        "too long"
    } else if name.contains('\0') {
        "contains NUL"
    } else {
        return Ok(());
    };
    Err(Error::InvalidName {
        name: name.to_owned(),
        reason,
    })
}

impl TransportInner {
    /// Register `name` locally and run the open handshake.
    #[instrument(level = "debug", skip(self, callbacks), fields(edge = %self.config.name))]
    pub(super) fn open_channel(
        &self,
        name: &str,
        callbacks: ChannelCallbacks,
    ) -> Result<Arc<Channel>> {
        validate_name(name)?;
        let (channel, remote_initiated) = {
            let mut tables = self.tables.lock();
            self.ensure_link_up()?;
            if tables.local.find(|c| c.name() == name).is_some() {
                return Err(Error::AlreadyOpen(name.to_owned()));
            }
            let existing = tables.remote.find(|c| c.name() == name).cloned();
            let remote_initiated = existing.is_some();
            let channel = existing.unwrap_or_else(|| Arc::new(Channel::new(name)));
            let lcid = tables
                .local
                .alloc_cyclic(Arc::clone(&channel))
                .map_err(|_| Error::IdsExhausted)?;
            channel.set_lcid(lcid);
            (channel, remote_initiated)
        };
        channel.set_callbacks(callbacks);
        channel.set_state(ChannelState::Opening);
        debug!(lcid = channel.lcid(), remote_initiated, "opening channel");

        let handshake = if remote_initiated {
            self.accept_remote_open(&channel)
        } else {
            self.initiate_open(&channel)
        };
        if let Err(err) = handshake {
            warn!(channel = name, error = %err, "open failed");
            self.unwind_open(&channel);
            return Err(err);
        }

        channel.set_state(ChannelState::Open);
        if let Err(err) = self.announce(&channel) {
            warn!(channel = name, error = %err, "failed to advertise intents");
            if matches!(err, Error::ConnectionReset) {
                return Err(err);
            }
        }
        debug!(
            lcid = channel.lcid(),
            rcid = channel.rcid(),
            "channel open"
        );
        Ok(channel)
    }

    /// We open first: OPEN out, then wait for the peer's OPEN and its ack.
    fn initiate_open(&self, channel: &Arc<Channel>) -> Result<()> {
        self.transmit(&[open_frame(channel)], true)?;
        self.wait_for(&channel.open_req, self.config.open_timeout, Operation::Open)?;
        if channel.claim_open_ack() {
            self.transmit(
                &[Frame::OpenAck {
                    cid: channel.rcid(),
                }],
                true,
            )?;
        }
        self.wait_for(&channel.open_ack, self.config.open_timeout, Operation::Open)
    }

    /// The peer opened first: ack it (once), then send our own OPEN.
    fn accept_remote_open(&self, channel: &Arc<Channel>) -> Result<()> {
        if channel.claim_open_ack() {
            self.transmit(
                &[Frame::OpenAck {
                    cid: channel.rcid(),
                }],
                true,
            )?;
        }
        self.transmit(&[open_frame(channel)], true)?;
        self.wait_for(&channel.open_ack, self.config.open_timeout, Operation::Open)
    }

    /// Undo a failed open so the name can be opened again.
    fn unwind_open(&self, channel: &Arc<Channel>) {
        let lcid = channel.lcid();
        if lcid != 0 && !self.is_in_reset() {
            // Let the peer drop whatever it registered for us. Its CLOSE_ACK
            // finds nothing once the id is gone and is ignored.
            if let Err(err) = self.transmit(&[Frame::Close { cid: lcid }], true) {
                trace!(error = %err, "close after failed open not sent");
            }
        }
        self.forget_local(channel);
        channel.clear_callbacks();
        channel.set_state(ChannelState::Closed);
    }

    /// Mark ready and advertise pending and default intents.
    fn announce(&self, channel: &Arc<Channel>) -> Result<()> {
        channel.set_ready(true);
        let reuse = self.features().contains(Features::INTENT_REUSE);
        let pending = {
            let mut intents = channel.intents.lock();
            'pools: for pool in &self.config.default_intents {
                for _ in 0..pool.count {
                    let inserted = LocalIntent::allocate(pool.size, reuse)
                        .and_then(|intent| intents.insert_local(intent));
                    if let Err(err) = inserted {
                        warn!(size = pool.size, error = %err, "default intent not allocated");
                        break 'pools;
                    }
                }
            }
            trace!(
                channel = channel.name(),
                local = intents.local_count(),
                "default intents allocated"
            );
            intents.take_pending_advertisements()
        };
        self.advertise(channel, &pending)
    }

    /// Send INTENT frames for `descriptors`.
    pub(super) fn advertise(
        &self,
        channel: &Channel,
        descriptors: &[IntentDescriptor],
    ) -> Result<()> {
        for batch in descriptors.chunks(ADVERTISE_BATCH) {
            self.transmit(
                &[Frame::Intent {
                    cid: channel.lcid(),
                    intents: batch.to_vec(),
                }],
                true,
            )?;
        }
        if !descriptors.is_empty() {
            trace!(channel = channel.name(), count = descriptors.len(), "intents advertised");
        }
        Ok(())
    }

    /// Local close: CLOSE out, then wait for the peer's CLOSE_ACK.
    #[instrument(level = "debug", skip(self, channel), fields(channel = channel.name()))]
    pub(super) fn close_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        channel.clear_callbacks();
        channel.set_ready(false);
        let lcid = channel.lcid();
        if lcid == 0 || self.is_in_reset() {
            self.forget_local(channel);
            channel.set_state(ChannelState::Closed);
            return Ok(());
        }

        channel.set_state(ChannelState::Closing);
        channel.close_ack.reinit();
        let peer_closed = channel.remote_closed();
        let result = self
            .transmit(&[Frame::Close { cid: lcid }], true)
            .and_then(|()| {
                if peer_closed {
                    Ok(())
                } else {
                    self.wait_for(&channel.close_ack, self.config.close_timeout, Operation::Close)
                }
            });
        match &result {
            // The peer is gone already; its CLOSE_ACK releases the id.
            Ok(()) if peer_closed => trace!(lcid, "close sent, ack pending"),
            Ok(()) => self.forget_local(channel),
            Err(err) => {
                warn!(lcid, error = %err, "close handshake incomplete, releasing id");
                self.forget_local(channel);
            }
        }
        channel.set_state(ChannelState::Closed);
        debug!(lcid, "channel closed");
        result
    }

    /// Remove the channel's local id if it still maps to this channel.
    fn forget_local(&self, channel: &Arc<Channel>) {
        let lcid = channel.lcid();
        if lcid != 0 {
            self.tables
                .lock()
                .local
                .remove_if(u32::from(lcid), |entry| Arc::ptr_eq(entry, channel));
        }
        channel.clear_lcid();
    }

    /// Peer OPEN, run on the deferred worker.
    #[instrument(level = "debug", skip(self), fields(edge = %self.config.name))]
    pub(super) fn rx_open(&self, rcid: u16, name: &str) {
        if rcid == 0 {
            warn!(name, "OPEN with reserved id 0 ignored");
            self.metrics.record_protocol_error();
            return;
        }
        let (channel, locally_open) = {
            let mut tables = self.tables.lock();
            if self.is_in_reset() {
                return;
            }
            let existing = tables.local.find(|c| c.name() == name).cloned();
            let channel = existing.unwrap_or_else(|| Arc::new(Channel::new(name)));
            if tables
                .remote
                .insert_at(u32::from(rcid), Arc::clone(&channel))
                .is_err()
            {
                warn!(name, "OPEN for a remote id already in use");
                self.metrics.record_protocol_error();
                return;
            }
            channel.set_rcid(u32::from(rcid));
            let locally_open = channel.lcid() != 0;
            (channel, locally_open)
        };
        channel.open_req.complete();
        debug!(name, locally_open, "peer opened channel");

        if !locally_open && channel.claim_open_ack() {
            if let Err(err) = self.transmit(&[Frame::OpenAck { cid: rcid }], true) {
                warn!(name, error = %err, "failed to ack peer open");
            }
        }
    }

    /// Peer OPEN_ACK for one of our ids.
    pub(super) fn rx_open_ack(&self, lcid: u16) {
        match self.local_channel(lcid) {
            Some(channel) => channel.open_ack.complete(),
            None => {
                warn!(lcid, "OPEN_ACK for unknown channel");
                self.metrics.record_protocol_error();
            }
        }
    }

    /// Peer CLOSE, run on the deferred worker.
    #[instrument(level = "debug", skip(self), fields(edge = %self.config.name))]
    pub(super) fn rx_close(&self, rcid: u16) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "CLOSE for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        channel.mark_remote_closed();
        channel.begin_closing();
        channel.intent_req.abort();

        if let Err(err) = self.transmit(&[Frame::CloseAck { cid: rcid }], true) {
            warn!(rcid, error = %err, "failed to ack peer close");
        }
        self.tables
            .lock()
            .remote
            .remove_if(u32::from(rcid), |entry| Arc::ptr_eq(entry, &channel));
        channel.clear_rcid();
        if channel.lcid() == 0 {
            channel.set_state(ChannelState::Closed);
        }
        debug!(name = channel.name(), "peer closed channel");
    }

    /// Peer CLOSE_ACK, run on the deferred worker.
    pub(super) fn rx_close_ack(&self, lcid: u16) {
        let removed = self.tables.lock().local.remove(u32::from(lcid));
        match removed {
            Some(channel) => {
                channel.clear_lcid();
                channel.close_ack.complete();
                trace!(lcid, name = channel.name(), "close acknowledged");
            }
            None => {
                warn!(lcid, "CLOSE_ACK for unknown channel");
                self.metrics.record_protocol_error();
            }
        }
    }

    /// Bounded wait, mapping the outcome onto transport errors.
    pub(super) fn wait_for(
        &self,
        completion: &Completion,
        timeout: Duration,
        operation: Operation,
    ) -> Result<()> {
        match completion.wait(timeout) {
            Ok(()) => Ok(()),
            Err(WaitError::TimedOut) => Err(Error::Timeout { operation }),
            Err(WaitError::Aborted) => Err(self.abort_error()),
        }
    }
}

fn open_frame(channel: &Channel) -> Frame {
    Frame::Open {
        cid: channel.lcid(),
        name: channel.name().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_checked_before_anything_is_sent() {
        assert!(validate_name("ping").is_ok());
        assert!(validate_name(&"n".repeat(NAME_MAX - 1)).is_ok());
        for bad in ["", "a\0b"] {
            assert!(matches!(validate_name(bad), Err(Error::InvalidName { .. })));
        }
        assert!(matches!(
            validate_name(&"n".repeat(NAME_MAX)),
            Err(Error::InvalidName { reason: "too long", .. })
        ));
    }
}
