//! Channel objects shared between the id tables, waiters and endpoints.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::protocol::Signals;

use super::intent::IntentTables;
use super::sync::Completion;

/// Lifecycle of a channel as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not open (never opened, closed, or torn down by a reset)
    Closed,
    /// Open handshake in progress
    Opening,
    /// Both sides opened; data may flow
    Open,
    /// Close in progress, or the peer closed first
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

type ReceiveFn = Arc<dyn Fn(Bytes) + Send + Sync>;
type SignalFn = Arc<dyn Fn(Signals, Signals) + Send + Sync>;

/// Callbacks registered when an endpoint is opened.
///
/// They run on the transport's receive worker; keep them short and do not
/// block on traffic from the same link.
#[derive(Clone, Default)]
pub struct ChannelCallbacks {
    on_receive: Option<ReceiveFn>,
    on_signals: Option<SignalFn>,
}

impl ChannelCallbacks {
    /// No callbacks; inbound messages are dropped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked with every fully reassembled message.
    #[must_use]
    pub fn on_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Invoked with the old and new remote signal masks.
    #[must_use]
    pub fn on_signals<F>(mut self, f: F) -> Self
    where
        F: Fn(Signals, Signals) + Send + Sync + 'static,
    {
        self.on_signals = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("on_receive", &self.on_receive.is_some())
            .field("on_signals", &self.on_signals.is_some())
            .finish()
    }
}

/// Synchronisation for the single outstanding intent request of a channel.
#[derive(Debug, Default)]
pub(crate) struct IntentRequestSync {
    /// Serialises requests so ack and grant pair up.
    pub(crate) lock: Mutex<()>,
    pub(crate) acked: Completion,
    pub(crate) granted: AtomicBool,
    /// Completed whenever a remote intent arrives or is returned.
    pub(crate) arrived: Completion,
}

impl IntentRequestSync {
    pub(crate) fn abort(&self) {
        self.granted.store(false, Ordering::Release);
        self.acked.abort();
        self.arrived.abort();
    }
}

/// One logical channel.
///
/// Owned through `Arc`: each id table entry holds one reference, and so
/// does every endpoint and in-flight handler. The object is freed when the
/// last of them lets go.
pub(crate) struct Channel {
    name: String,
    lcid: AtomicU32,
    rcid: AtomicU32,
    state: Mutex<ChannelState>,
    pub(crate) open_ack: Completion,
    pub(crate) open_req: Completion,
    pub(crate) close_ack: Completion,
    open_ack_sent: AtomicBool,
    remote_closed: AtomicBool,
    ready: AtomicBool,
    local_signals: AtomicU32,
    remote_signals: AtomicU32,
    callbacks: Mutex<ChannelCallbacks>,
    pub(crate) intents: Mutex<IntentTables>,
    pub(crate) intent_req: IntentRequestSync,
}

impl Channel {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            lcid: AtomicU32::new(0),
            rcid: AtomicU32::new(0),
            state: Mutex::new(ChannelState::Closed),
            open_ack: Completion::new(),
            open_req: Completion::new(),
            close_ack: Completion::new(),
            open_ack_sent: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            local_signals: AtomicU32::new(0),
            remote_signals: AtomicU32::new(0),
            callbacks: Mutex::new(ChannelCallbacks::default()),
            intents: Mutex::new(IntentTables::default()),
            intent_req: IntentRequestSync::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Local id, or 0 while not registered in the local table.
    pub(crate) fn lcid(&self) -> u16 {
        id_to_wire(self.lcid.load(Ordering::Acquire))
    }

    /// Remote id, or 0 while not registered in the remote table.
    pub(crate) fn rcid(&self) -> u16 {
        id_to_wire(self.rcid.load(Ordering::Acquire))
    }

    pub(crate) fn set_lcid(&self, id: u32) {
        self.lcid.store(id, Ordering::Release);
    }

    pub(crate) fn set_rcid(&self, id: u32) {
        self.rcid.store(id, Ordering::Release);
    }

    /// Leave the local table. A later open on this object needs a fresh
    /// OPEN_ACK from the peer.
    pub(crate) fn clear_lcid(&self) {
        self.set_lcid(0);
        self.open_ack.reinit();
    }

    /// Leave the remote table. A later OPEN from the peer carries a new id
    /// that has not been acknowledged yet.
    pub(crate) fn clear_rcid(&self) {
        self.set_rcid(0);
        self.open_req.reinit();
        self.open_ack_sent.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: ChannelState) {
        let mut state = self.state.lock();
        if *state != next {
            trace!(channel = %self.name, from = %*state, to = %next, "channel state");
            *state = next;
        }
    }

    /// Move `Open` to `Closing`; other states are left alone.
    pub(crate) fn begin_closing(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Open {
            *state = ChannelState::Closing;
        }
    }

    /// Claim the right to send OPEN_ACK. `true` once per remote id.
    pub(crate) fn claim_open_ack(&self) -> bool {
        !self.open_ack_sent.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub(crate) fn local_signals(&self) -> Signals {
        Signals::from_bits(self.local_signals.load(Ordering::Acquire))
    }

    pub(crate) fn set_local_signals(&self, signals: Signals) {
        self.local_signals.store(signals.bits(), Ordering::Release);
    }

    pub(crate) fn remote_signals(&self) -> Signals {
        Signals::from_bits(self.remote_signals.load(Ordering::Acquire))
    }

    /// Store the peer's signals, returning the previous mask.
    pub(crate) fn swap_remote_signals(&self, signals: Signals) -> Signals {
        Signals::from_bits(self.remote_signals.swap(signals.bits(), Ordering::AcqRel))
    }

    pub(crate) fn set_callbacks(&self, callbacks: ChannelCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    pub(crate) fn clear_callbacks(&self) {
        *self.callbacks.lock() = ChannelCallbacks::default();
    }

    /// Hand a message to the receive callback. Returns `false` if none is set.
    pub(crate) fn deliver(&self, message: Bytes) -> bool {
        let callback = self.callbacks.lock().on_receive.clone();
        match callback {
            Some(callback) => {
                callback(message);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify_signals(&self, old: Signals, new: Signals) {
        let callback = self.callbacks.lock().on_signals.clone();
        if let Some(callback) = callback {
            callback(old, new);
        }
    }

    /// Fail every waiter parked on this channel.
    pub(crate) fn abort_waiters(&self) {
        self.open_ack.abort();
        self.open_req.abort();
        self.close_ack.abort();
        self.intent_req.abort();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("lcid", &self.lcid())
            .field("rcid", &self.rcid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        trace!(channel = %self.name, "channel released");
    }
}

fn id_to_wire(id: u32) -> u16 {
    u16::try_from(id).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::transport::sync::WaitError;

    #[test]
    fn open_ack_is_claimed_once() {
        let channel = Channel::new("ping");
        assert!(channel.claim_open_ack());
        assert!(!channel.claim_open_ack());
    }

    #[test]
    fn released_ids_rearm_the_open_handshake() {
        let channel = Channel::new("again");
        assert!(channel.claim_open_ack());
        channel.open_ack.complete();
        channel.open_req.complete();

        channel.clear_lcid();
        assert_eq!(channel.open_ack.wait(Duration::ZERO), Err(WaitError::TimedOut));
        assert!(channel.open_req.wait(Duration::ZERO).is_ok());
        assert!(!channel.claim_open_ack());

        channel.clear_rcid();
        assert_eq!(channel.open_req.wait(Duration::ZERO), Err(WaitError::TimedOut));
        assert!(channel.claim_open_ack());
    }

    #[test]
    fn begin_closing_only_leaves_open() {
        let channel = Channel::new("ping");
        channel.begin_closing();
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.set_state(ChannelState::Open);
        channel.begin_closing();
        assert_eq!(channel.state(), ChannelState::Closing);
    }

    #[test]
    fn delivery_goes_through_registered_callback() {
        let channel = Channel::new("echo");
        assert!(!channel.deliver(Bytes::from_static(b"dropped")));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        channel.set_callbacks(ChannelCallbacks::new().on_receive(move |msg| {
            counter.fetch_add(msg.len(), Ordering::SeqCst);
        }));
        assert!(channel.deliver(Bytes::from_static(b"12345")));
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        channel.clear_callbacks();
        assert!(!channel.deliver(Bytes::from_static(b"x")));
    }

    #[test]
    fn remote_signal_swap_returns_previous() {
        let channel = Channel::new("sig");
        let old = channel.swap_remote_signals(Signals::from_bits(Signals::CTS));
        assert_eq!(old, Signals::empty());
        assert_eq!(channel.remote_signals().bits(), Signals::CTS);
    }
}
