//! Worker threads draining the inbound and deferred queues.
//!
//! Workers only hold a weak reference to the transport. They exit once the
//! transport is dropped and its queue senders go with it.

use std::io;
use std::sync::Weak;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use tracing::trace;

use super::dispatch::Deferred;
use super::transport::TransportInner;

pub(super) fn spawn_inbound(
    name: &str,
    inner: Weak<TransportInner>,
    queue: Receiver<Bytes>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("{name}-rx"))
        .spawn(move || {
            while let Ok(buf) = queue.recv() {
                let Some(inner) = inner.upgrade() else { break };
                inner.process_inbound(buf);
            }
            trace!("inbound worker exiting");
        })?;
    Ok(())
}

pub(super) fn spawn_deferred(
    name: &str,
    inner: Weak<TransportInner>,
    queue: Receiver<Deferred>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("{name}-defer"))
        .spawn(move || {
            while let Ok(work) = queue.recv() {
                let Some(inner) = inner.upgrade() else { break };
                inner.run_deferred(work);
            }
            trace!("deferred worker exiting");
        })?;
    Ok(())
}
