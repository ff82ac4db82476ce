//! Transmit credit tracking against the peer's receive FIFO.
//!
//! Credit is counted in words. It is debited only after a successful write
//! and replenished only from an explicit fill-register read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::protocol::{HEADER_SIZE, WORD_SIZE};

use super::error::{Error, LinkError, Operation, Result};
use super::link::FifoFill;

/// Words always held back so a READ_NOTIFY fits even when senders are starved.
pub(crate) const FIFO_FULL_RESERVE: usize = HEADER_SIZE / WORD_SIZE;

/// Credit window over the peer FIFO.
#[derive(Debug, Clone, Default)]
pub(crate) struct CreditWindow {
    capacity: usize,
    tx_avail: usize,
    watermark_reached: bool,
}

impl CreditWindow {
    /// Window for a FIFO of `capacity` words, fully free.
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tx_avail: capacity,
            watermark_reached: false,
        }
    }

    /// Words a sender may use right now.
    pub(crate) const fn available(&self) -> usize {
        self.tx_avail.saturating_sub(FIFO_FULL_RESERVE)
    }

    /// Largest reservation that can ever be satisfied.
    pub(crate) const fn max_reservation(&self) -> usize {
        self.capacity.saturating_sub(FIFO_FULL_RESERVE)
    }

    pub(crate) const fn watermark_reached(&self) -> bool {
        self.watermark_reached
    }

    /// Debit words after a write went through.
    pub(crate) fn consume(&mut self, words: usize) {
        self.tx_avail = self.tx_avail.saturating_sub(words);
        if self.tx_avail < self.capacity / 2 {
            self.watermark_reached = true;
        }
    }

    /// Adopt a fresh `tx_avail` reading. Returns `true` once back above half.
    pub(crate) fn refresh(&mut self, tx_avail: usize) -> bool {
        self.tx_avail = tx_avail.min(self.capacity);
        if self.tx_avail > self.capacity / 2 {
            self.watermark_reached = false;
        }
        !self.watermark_reached
    }
}

/// State guarded by the transmit lock.
#[derive(Debug, Default)]
pub(crate) struct TxState {
    pub(crate) window: CreditWindow,
    read_notify_sent: bool,
}

/// Transmit lock holder. Frames are written while this is alive.
pub(crate) struct Reservation<'a> {
    pub(crate) state: MutexGuard<'a, TxState>,
    /// Time spent waiting for credit, if the sender had to wait at all.
    pub(crate) stalled: Option<Duration>,
}

/// Parameters of a blocking reservation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReserveWait {
    pub(crate) timeout: Duration,
    pub(crate) poll: Duration,
}

/// Credit window plus the transmit ordering lock.
#[derive(Debug, Default)]
pub(crate) struct CreditManager {
    state: Mutex<TxState>,
    space: Condvar,
}

impl CreditManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start over with a freshly read FIFO capacity.
    pub(crate) fn reset_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.window = CreditWindow::new(capacity);
        state.read_notify_sent = false;
        drop(state);
        self.space.notify_all();
    }

    /// Largest reservation the current window can ever satisfy.
    pub(crate) fn max_reservation(&self) -> usize {
        self.state.lock().window.max_reservation()
    }

    /// Take the transmit lock with at least `words` of credit available.
    ///
    /// With `wait == None` an empty window fails with [`Error::WouldBlock`].
    /// Otherwise the first starved iteration calls `notify` once to emit a
    /// READ_NOTIFY out of the reserve, then sleeps on the condition variable
    /// (releasing the lock) until credit shows up, the timeout expires, or
    /// `in_reset` is raised.
    pub(crate) fn reserve<F>(
        &self,
        words: usize,
        wait: Option<ReserveWait>,
        in_reset: &AtomicBool,
        mut notify: F,
    ) -> Result<Reservation<'_>>
    where
        F: FnMut(&mut TxState) -> Result<()>,
    {
        let mut state = self.state.lock();
        let max = state.window.max_reservation();
        if max > 0 && words > max {
            return Err(Error::MessageSize {
                len: words * WORD_SIZE,
                max: max * WORD_SIZE,
            });
        }

        let mut started: Option<Instant> = None;
        loop {
            if in_reset.load(Ordering::Acquire) {
                return Err(Error::ConnectionReset);
            }
            if state.window.available() >= words {
                state.read_notify_sent = false;
                return Ok(Reservation {
                    state,
                    stalled: started.map(|start| start.elapsed()),
                });
            }
            let Some(wait) = wait else {
                return Err(Error::WouldBlock);
            };

            let start = *started.get_or_insert_with(Instant::now);
            let elapsed = start.elapsed();
            if elapsed >= wait.timeout {
                return Err(Error::Timeout {
                    operation: Operation::Credit,
                });
            }
            if !state.read_notify_sent {
                state.read_notify_sent = true;
                notify(&mut *state)?;
            }
            trace!(
                needed = words,
                available = state.window.available(),
                "waiting for transmit credit"
            );
            let slice = wait.poll.min(wait.timeout - elapsed);
            self.space.wait_for(&mut state, slice);
        }
    }

    /// Handle a space-freed event by re-reading the fill register.
    ///
    /// Only acts while the watermark is reached or a sender is starved;
    /// otherwise the local count is still good enough.
    pub(crate) fn space_freed<F>(&self, read_fill: F)
    where
        F: FnOnce() -> std::result::Result<u32, LinkError>,
    {
        let mut state = self.state.lock();
        if !state.window.watermark_reached() && !state.read_notify_sent {
            return;
        }
        match read_fill() {
            Ok(raw) => {
                let fill = FifoFill::from_raw(raw);
                let recovered = state.window.refresh(usize::from(fill.tx_avail));
                trace!(tx_avail = fill.tx_avail, recovered, "credit refreshed");
                drop(state);
                self.space.notify_all();
            }
            Err(err) => warn!(error = %err, "failed to read FIFO fill level"),
        }
    }

    /// Wake every sleeping sender so it re-checks the reset flag.
    pub(crate) fn wake_all(&self) {
        self.space.notify_all();
    }
}
