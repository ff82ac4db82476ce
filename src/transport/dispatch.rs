//! Inbound command processing.
//!
//! Frames that only touch per-channel state are handled inline on the
//! receive worker. OPEN, CLOSE and CLOSE_ACK mutate the channel tables and
//! may block on credit, so they are queued for the deferred worker and
//! processed strictly in arrival order.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::protocol::{Features, Frame, FrameIter, IntentDescriptor, PROTOCOL_VERSION, Signals};

use super::intent::{LocalIntent, ReceiveError};
use super::metrics::IntentRequestOutcome;
use super::transport::TransportInner;

/// Slow-path work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Deferred {
    Open { rcid: u16, name: String },
    Close { rcid: u16 },
    CloseAck { lcid: u16 },
}

impl TransportInner {
    /// Walk one inbound buffer, dispatching each frame in order.
    pub(super) fn process_inbound(&self, buf: Bytes) {
        for item in FrameIter::new(buf) {
            if self.is_in_reset() {
                trace!("link reset mid-buffer, dropping remaining frames");
                return;
            }
            match item {
                Ok(frame) => {
                    self.metrics.record_frame_received();
                    self.dispatch(frame);
                }
                Err(err) => {
                    warn!(error = %err, "malformed inbound frame");
                    self.metrics.record_protocol_error();
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        trace!(opcode = %frame.opcode(), "rx frame");
        match frame {
            Frame::Version { version, features } => self.rx_version(version, features),
            Frame::VersionAck { version, features } => self.rx_version_ack(version, features),
            Frame::Open { cid, name } => self.defer(Deferred::Open { rcid: cid, name }),
            Frame::Close { cid } => self.defer(Deferred::Close { rcid: cid }),
            Frame::CloseAck { cid } => self.defer(Deferred::CloseAck { lcid: cid }),
            Frame::OpenAck { cid } => self.rx_open_ack(cid),
            Frame::Intent { cid, intents } => self.rx_intent(cid, &intents),
            Frame::RxDone { cid, iid, reuse } => self.rx_done(cid, iid, reuse),
            Frame::IntentRequest { cid, size } => self.rx_intent_request(cid, size),
            Frame::IntentRequestAck { cid, granted } => self.rx_intent_request_ack(cid, granted),
            Frame::TxData {
                cid,
                iid,
                cont,
                chunk,
            } => {
                if !cont {
                    self.restart_intent(cid, iid);
                }
                self.rx_data(cid, iid, &chunk.payload, chunk.left_size);
            }
            Frame::TxShortData {
                cid,
                iid,
                left_size,
                payload,
            } => self.rx_data(cid, iid, &payload, left_size),
            Frame::ReadNotify => trace!("peer is waiting for FIFO space"),
            Frame::Signals { cid, native } => self.rx_signals(cid, native),
        }
    }

    fn defer(&self, work: Deferred) {
        if self.deferred_tx.send(work).is_err() {
            warn!("deferred worker is gone");
        }
    }

    /// Run one slow-path item on the deferred worker.
    pub(super) fn run_deferred(&self, work: Deferred) {
        if self.is_in_reset() {
            trace!(?work, "dropping deferred work while in reset");
            return;
        }
        match work {
            Deferred::Open { rcid, name } => self.rx_open(rcid, &name),
            Deferred::Close { rcid } => self.rx_close(rcid),
            Deferred::CloseAck { lcid } => self.rx_close_ack(lcid),
        }
    }

    fn rx_version(&self, version: u16, features: Features) {
        if version == 0 {
            trace!("ignoring version 0 announcement");
            return;
        }
        let agreed = self.features().intersect(features);
        self.features.store(agreed.bits(), Ordering::Release);
        self.negotiated.store(true, Ordering::Release);
        debug!(version, features = ?agreed, "peer version accepted");
        self.send_version(true);
    }

    fn rx_version_ack(&self, version: u16, features: Features) {
        match version {
            0 => error!("peer rejected every protocol version"),
            PROTOCOL_VERSION if features == self.features() => {
                self.negotiated.store(true, Ordering::Release);
                debug!(features = ?features, "version negotiated");
            }
            PROTOCOL_VERSION => {
                let agreed = self.features().intersect(features);
                self.features.store(agreed.bits(), Ordering::Release);
                debug!(features = ?agreed, "renegotiating features");
                self.send_version(false);
            }
            other => {
                debug!(version = other, "peer acked a different version, re-announcing");
                self.send_version(false);
            }
        }
    }

    fn rx_intent(&self, rcid: u16, intents: &[IntentDescriptor]) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "INTENT for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        let total = {
            let mut tables = channel.intents.lock();
            for descriptor in intents {
                if !tables.add_remote(*descriptor) {
                    warn!(rcid, iid = descriptor.id, "duplicate remote intent id");
                    self.metrics.record_protocol_error();
                }
            }
            tables.remote_count()
        };
        trace!(rcid, count = intents.len(), total, "remote intents added");
        channel.intent_req.arrived.complete();
    }

    fn rx_done(&self, rcid: u16, iid: u32, reuse: bool) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "RX_DONE for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        if !channel.intents.lock().remote_done(iid, reuse) {
            warn!(rcid, iid, "RX_DONE for unknown intent");
            self.metrics.record_protocol_error();
        }
        channel.intent_req.arrived.complete();
    }

    fn rx_intent_request(&self, rcid: u16, size: u32) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "INTENT_REQUEST for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        let size = size as usize;
        let granted = if size > self.config.max_intent_size {
            debug!(size, max = self.config.max_intent_size, "intent request too large");
            false
        } else {
            let allocated = LocalIntent::allocate(size, false)
                .and_then(|intent| channel.intents.lock().insert_local(intent));
            match allocated {
                Ok(id) => {
                    if channel.is_ready() {
                        let descriptor = channel.intents.lock().take_advertisement(id);
                        if let Some(descriptor) = descriptor {
                            if let Err(err) = self.advertise(&channel, &[descriptor]) {
                                warn!(error = %err, "failed to advertise requested intent");
                            }
                        }
                    }
                    true
                }
                Err(err) => {
                    warn!(size, error = %err, "intent request denied");
                    false
                }
            }
        };

        let ack = Frame::IntentRequestAck {
            cid: channel.lcid(),
            granted,
        };
        if let Err(err) = self.transmit(&[ack], true) {
            warn!(error = %err, "failed to answer intent request");
        }
        self.metrics.record_intent_request(if granted {
            IntentRequestOutcome::Granted
        } else {
            IntentRequestOutcome::Denied
        });
    }

    fn rx_intent_request_ack(&self, rcid: u16, granted: bool) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "INTENT_REQUEST_ACK for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        channel.intent_req.granted.store(granted, Ordering::Release);
        channel.intent_req.acked.complete();
    }

    /// A first chunk found the intent mid-message: the earlier send died.
    fn restart_intent(&self, rcid: u16, iid: u32) {
        let Some(channel) = self.remote_channel(rcid) else {
            return;
        };
        let stale = channel.intents.lock().discard_partial(iid);
        if stale > 0 {
            warn!(rcid, iid, stale, "unfinished message discarded");
            self.metrics.record_protocol_error();
        }
    }

    fn rx_data(&self, rcid: u16, iid: u32, payload: &[u8], left_size: u32) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "data for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        let received = channel.intents.lock().receive(iid, payload, left_size);
        match received {
            Ok(None) => trace!(rcid, iid, left_size, "fragment stored"),
            Ok(Some(delivery)) => {
                let done = Frame::RxDone {
                    cid: channel.lcid(),
                    iid: delivery.iid,
                    reuse: delivery.reuse,
                };
                if let Err(err) = self.transmit(&[done], true) {
                    warn!(error = %err, "failed to return intent");
                }
                let delivered = channel.deliver(delivery.message);
                if !delivered {
                    trace!(channel = channel.name(), "no receive callback, message dropped");
                }
                self.metrics.record_delivery(delivered);
            }
            Err(ReceiveError::UnknownIntent) => {
                warn!(rcid, iid, "data for unknown intent");
                self.metrics.record_protocol_error();
            }
            Err(ReceiveError::Overflow {
                size,
                offset,
                chunk,
            }) => {
                warn!(rcid, iid, size, offset, chunk, "data overruns intent, dropped");
                self.metrics.record_protocol_error();
            }
        }
    }

    fn rx_signals(&self, rcid: u16, native: u32) {
        let Some(channel) = self.remote_channel(rcid) else {
            warn!(rcid, "SIGNALS for unknown channel");
            self.metrics.record_protocol_error();
            return;
        };
        let signals = Signals::from_native(native);
        let old = channel.swap_remote_signals(signals);
        trace!(rcid, %old, new = %signals, "remote signals");
        channel.notify_signals(old, signals);
    }
}
