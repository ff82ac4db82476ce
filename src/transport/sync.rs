//! One-shot completion signal with bounded waits.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How a wait on a [`Completion`] ended without being completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The deadline passed
    TimedOut,
    /// The completion was aborted by a reset or a close
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Pending,
    Done,
    Aborted,
}

/// Latch that waiters block on until it is completed or aborted.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    state: Mutex<State>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mark done and wake every waiter.
    pub(crate) fn complete(&self) {
        self.settle(State::Done);
    }

    /// Fail every current and future waiter until [`Completion::reinit`].
    pub(crate) fn abort(&self) {
        self.settle(State::Aborted);
    }

    fn settle(&self, next: State) {
        let mut state = self.state.lock();
        if *state == State::Pending || next == State::Aborted {
            *state = next;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Re-arm before starting a new request/response exchange.
    pub(crate) fn reinit(&self) {
        *self.state.lock() = State::Pending;
    }

    /// Block until completed, aborted, or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                State::Done => return Ok(()),
                State::Aborted => return Err(WaitError::Aborted),
                State::Pending => {}
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return match *state {
                    State::Done => Ok(()),
                    State::Aborted => Err(WaitError::Aborted),
                    State::Pending => Err(WaitError::TimedOut),
                };
            }
        }
    }
}
