//! Link reset: tear down every channel and fail everything in flight.

use std::sync::atomic::Ordering;

use tracing::{debug, info};

use super::channel::ChannelState;
use super::transport::TransportInner;

impl TransportInner {
    /// Drop all link state after the remote processor went away.
    ///
    /// The reset flag goes up first so that senders, waiters and queued work
    /// observe it before the tables are emptied. The transport stays in
    /// reset until the link reports ready again.
    pub(super) fn reset(&self) {
        if self.in_reset.swap(true, Ordering::AcqRel) {
            debug!("reset while already in reset");
        }
        self.status.lock().clear();
        self.negotiated.store(false, Ordering::Release);
        self.metrics.record_reset();
        self.credit.wake_all();

        let dropped_frames = self.inbound_rx.try_iter().count();
        let dropped_deferred = self.deferred_rx.try_iter().count();

        let (local, remote) = {
            let mut tables = self.tables.lock();
            (tables.local.drain(), tables.remote.drain())
        };
        for (_, channel) in &local {
            channel.set_lcid(0);
        }
        for (_, channel) in &remote {
            channel.set_rcid(0);
        }
        for (_, channel) in local.iter().chain(remote.iter()) {
            channel.set_ready(false);
            channel.set_state(ChannelState::Closed);
            channel.abort_waiters();
        }

        info!(
            local = local.len(),
            remote = remote.len(),
            dropped_frames,
            dropped_deferred,
            "link reset, channels torn down"
        );
    }
}
