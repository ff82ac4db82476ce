//! Transport facade: owns the link, the channel tables and the transmit path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::protocol::{Features, Frame, PROTOCOL_VERSION, WORD_SIZE};

use super::channel::{Channel, ChannelCallbacks, ChannelState};
use super::config::TransportConfig;
use super::credit::{CreditManager, ReserveWait, TxState};
use super::dispatch::Deferred;
use super::endpoint::Endpoint;
use super::error::{Error, LinkError, Result};
use super::ids::IdMap;
use super::link::{FifoSize, Link, LinkEvent, LinkStatus, Register};
use super::metrics::{Metrics, MetricsSnapshot};
use super::worker;

/// Exclusive upper bound of local channel ids.
pub(super) const CHANNEL_ID_MAX: u32 = 1 << 16;

/// The two channel id tables. Guarded by one mutex.
#[derive(Debug)]
pub(super) struct ChannelTables {
    /// Keyed by the id this side assigned.
    pub(super) local: IdMap<Arc<Channel>>,
    /// Keyed by the id the peer assigned.
    pub(super) remote: IdMap<Arc<Channel>>,
}

impl ChannelTables {
    fn new() -> Self {
        Self {
            local: IdMap::new(1, CHANNEL_ID_MAX),
            remote: IdMap::new(1, CHANNEL_ID_MAX),
        }
    }
}

pub(super) struct TransportInner {
    pub(super) config: TransportConfig,
    pub(super) link: Arc<dyn Link>,
    pub(super) tables: Mutex<ChannelTables>,
    pub(super) credit: CreditManager,
    pub(super) in_reset: AtomicBool,
    pub(super) status: Mutex<LinkStatus>,
    pub(super) features: AtomicU32,
    pub(super) negotiated: AtomicBool,
    pub(super) metrics: Metrics,
    pub(super) inbound_tx: Sender<Bytes>,
    pub(super) inbound_rx: Receiver<Bytes>,
    pub(super) deferred_tx: Sender<Deferred>,
    pub(super) deferred_rx: Receiver<Deferred>,
}

/// Snapshot of one channel, as returned by [`Transport::channels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel name
    pub name: String,
    /// Id this side assigned, if registered
    pub local_id: Option<u16>,
    /// Id the peer assigned, if registered
    pub remote_id: Option<u16>,
    /// Current state
    pub state: ChannelState,
}

/// Handle to one transport instance (one link to one remote processor).
///
/// Cheap to clone. The link adapter feeds events in through
/// [`Transport::handle_event`]; applications open named channels with
/// [`Transport::open`].
#[derive(Clone)]
pub struct Transport {
    pub(super) inner: Arc<TransportInner>,
}

/// Non-owning handle, for link adapters that must call back into the transport.
#[derive(Clone, Debug, Default)]
pub struct WeakTransport {
    inner: Weak<TransportInner>,
}

impl WeakTransport {
    /// Upgrade to a full handle if the transport is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

impl Transport {
    /// Create a transport over `link` and start its worker threads.
    ///
    /// The transport starts in reset; it becomes usable once the link has
    /// reported all four ready conditions.
    #[instrument(level = "debug", skip(link, config), fields(name = %config.name))]
    pub fn new(link: Arc<dyn Link>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = unbounded();
        let (deferred_tx, deferred_rx) = unbounded();
        let features = config.features.bits();

        let inner = Arc::new(TransportInner {
            config,
            link,
            tables: Mutex::new(ChannelTables::new()),
            credit: CreditManager::new(),
            in_reset: AtomicBool::new(true),
            status: Mutex::new(LinkStatus::default()),
            features: AtomicU32::new(features),
            negotiated: AtomicBool::new(false),
            metrics: Metrics::default(),
            inbound_tx,
            inbound_rx,
            deferred_tx,
            deferred_rx,
        });

        let name = inner.config.name.clone();
        worker::spawn_inbound(&name, Arc::downgrade(&inner), inner.inbound_rx.clone())?;
        worker::spawn_deferred(&name, Arc::downgrade(&inner), inner.deferred_rx.clone())?;
        debug!("transport created");
        Ok(Self { inner })
    }

    /// Feed one event from the link adapter.
    ///
    /// Never blocks on traffic: inbound data is queued for the receive
    /// worker, credit refreshes and resets run inline.
    pub fn handle_event(&self, event: LinkEvent) {
        let inner = &self.inner;
        match event {
            LinkEvent::ApplicationRunning => inner.observe_status(LinkStatus::APPLICATION_RUNNING),
            LinkEvent::InboundFifoReady => inner.observe_status(LinkStatus::INBOUND_FIFO_READY),
            LinkEvent::OutboundFifoReady => inner.observe_status(LinkStatus::OUTBOUND_FIFO_READY),
            LinkEvent::ControlReady => inner.observe_status(LinkStatus::CONTROL_READY),
            LinkEvent::DataAvailable(buf) => {
                if inner.is_in_reset() {
                    trace!(len = buf.len(), "dropping inbound data while in reset");
                    return;
                }
                inner.metrics.record_received(buf.len());
                if inner.inbound_tx.send(buf).is_err() {
                    warn!("inbound worker is gone");
                }
            }
            LinkEvent::SpaceFreed => inner
                .credit
                .space_freed(|| inner.link.read_register(Register::FifoFill)),
            LinkEvent::Reset => inner.reset(),
            LinkEvent::Fault(fault) => warn!(%fault, "link fault reported"),
        }
    }

    /// Open (or accept) the channel called `name`.
    ///
    /// Blocks until both sides have opened it or a handshake timeout
    /// expires. On success the configured default intents are advertised.
    pub fn open(&self, name: &str, callbacks: ChannelCallbacks) -> Result<Endpoint> {
        let channel = self.inner.open_channel(name, callbacks)?;
        Ok(Endpoint::new(self.clone(), channel))
    }

    /// `true` until the link reports ready, and again after a reset.
    #[must_use]
    pub fn is_in_reset(&self) -> bool {
        self.inner.is_in_reset()
    }

    /// Features currently agreed with the peer.
    #[must_use]
    pub fn features(&self) -> Features {
        self.inner.features()
    }

    /// Whether version negotiation has completed since the last link-up.
    #[must_use]
    pub fn is_negotiated(&self) -> bool {
        self.inner.negotiated.load(Ordering::Acquire)
    }

    /// Edge name from the configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Counters since creation.
    #[must_use]
    pub fn stats(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Every channel currently reachable through either id table.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let tables = self.inner.tables.lock();
        let mut seen: Vec<&Arc<Channel>> = Vec::new();
        for (_, channel) in tables.local.iter().chain(tables.remote.iter()) {
            if !seen.iter().any(|known| Arc::ptr_eq(known, channel)) {
                seen.push(channel);
            }
        }
        seen.into_iter()
            .map(|channel| ChannelInfo {
                name: channel.name().to_owned(),
                local_id: non_zero(channel.lcid()),
                remote_id: non_zero(channel.rcid()),
                state: channel.state(),
            })
            .collect()
    }

    /// Non-owning handle for callbacks from the link adapter.
    #[must_use]
    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.config.name)
            .field("in_reset", &self.inner.is_in_reset())
            .field("features", &self.inner.features())
            .finish_non_exhaustive()
    }
}

impl TransportInner {
    pub(super) fn is_in_reset(&self) -> bool {
        self.in_reset.load(Ordering::Acquire)
    }

    pub(super) fn ensure_link_up(&self) -> Result<()> {
        if self.is_in_reset() {
            Err(Error::ConnectionReset)
        } else {
            Ok(())
        }
    }

    pub(super) fn features(&self) -> Features {
        Features::from_bits(self.features.load(Ordering::Acquire))
    }

    fn observe_status(&self, bit: u32) {
        let came_up = self.status.lock().observe(bit);
        if came_up {
            self.link_up();
        }
    }

    /// All ready conditions seen: size the credit window and start negotiation.
    fn link_up(&self) {
        let size = match self.link.read_register(Register::FifoSize) {
            Ok(raw) => FifoSize::from_raw(raw),
            Err(err) => {
                error!(error = %err, "failed to read FIFO size, staying in reset");
                self.status.lock().clear();
                return;
            }
        };
        self.credit.reset_capacity(usize::from(size.outbound));
        self.features.store(self.config.features.bits(), Ordering::Release);
        self.negotiated.store(false, Ordering::Release);
        self.in_reset.store(false, Ordering::Release);
        info!(
            inbound_words = size.inbound,
            outbound_words = size.outbound,
            "link up"
        );
        self.send_version(false);
    }

    /// Send VERSION (or VERSION_ACK) with the current feature set.
    pub(super) fn send_version(&self, ack: bool) {
        let features = self.features();
        let frame = if ack {
            Frame::VersionAck {
                version: PROTOCOL_VERSION,
                features,
            }
        } else {
            Frame::Version {
                version: PROTOCOL_VERSION,
                features,
            }
        };
        if let Err(err) = self.transmit(&[frame], true) {
            warn!(error = %err, ack, "failed to send version");
        }
    }

    /// Encode `frames` back to back and write them under one reservation.
    pub(super) fn transmit(&self, frames: &[Frame], wait: bool) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
        for frame in frames {
            trace!(opcode = %frame.opcode(), "tx frame");
            frame.encode(&mut buf);
        }
        self.transmit_encoded(&buf, frames.len(), wait)
    }

    fn transmit_encoded(&self, data: &[u8], frames: usize, wait: bool) -> Result<()> {
        let words = data.len() / WORD_SIZE;
        let wait = wait.then_some(ReserveWait {
            timeout: self.config.credit_timeout,
            poll: self.config.credit_poll_interval,
        });
        let mut reservation =
            self.credit
                .reserve(words, wait, &self.in_reset, |state| self.send_read_notify(state))?;
        if let Some(stalled) = reservation.stalled {
            self.metrics.record_credit_stall(stalled);
        }
        self.write_locked(&mut reservation.state, data)?;
        self.metrics.record_sent(frames, data.len());
        Ok(())
    }

    /// Emit READ_NOTIFY out of the reserved words.
    fn send_read_notify(&self, state: &mut TxState) -> Result<()> {
        trace!("tx credit starved, sending read notify");
        self.write_locked(state, &Frame::ReadNotify.to_bytes())?;
        self.metrics.record_read_notify();
        self.metrics.record_sent(1, crate::protocol::HEADER_SIZE);
        Ok(())
    }

    /// Write while holding the transmit lock, backing off while the link is busy.
    fn write_locked(&self, state: &mut TxState, data: &[u8]) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.link.write(data) {
                Ok(()) => {
                    state.window.consume(data.len() / WORD_SIZE);
                    return Ok(());
                }
                Err(LinkError::Busy) => {
                    if self.is_in_reset() {
                        return Err(Error::ConnectionReset);
                    }
                    if started.elapsed() >= self.config.credit_timeout {
                        return Err(LinkError::Busy.into());
                    }
                    thread::sleep(self.config.tx_retry_backoff);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Error to report when a wait was aborted underneath a caller.
    pub(super) fn abort_error(&self) -> Error {
        if self.is_in_reset() {
            Error::ConnectionReset
        } else {
            Error::ChannelClosed
        }
    }

    pub(super) fn local_channel(&self, lcid: u16) -> Option<Arc<Channel>> {
        self.tables.lock().local.get(u32::from(lcid)).cloned()
    }

    pub(super) fn remote_channel(&self, rcid: u16) -> Option<Arc<Channel>> {
        self.tables.lock().remote.get(u32::from(rcid)).cloned()
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        debug!(name = %self.config.name, "transport dropped");
    }
}

fn non_zero(id: u16) -> Option<u16> {
    (id != 0).then_some(id)
}
