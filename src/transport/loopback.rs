//! In-process FIFO link pair.
//!
//! Two [`Transport`]s wired back to back through bounded word FIFOs. Each
//! direction has a pump thread standing in for the peer's receive
//! interrupt: it hands written buffers to the receiving transport, frees
//! their words and reports the space back to the writer. Used by the
//! integration tests, the benches and the demos.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use tracing::trace;

use crate::protocol::{Frame, FrameIter, WORD_SIZE};

use super::config::TransportConfig;
use super::error::{LinkError, Result};
use super::link::{FifoFill, FifoSize, Link, LinkEvent, Register};
use super::transport::{Transport, WeakTransport};

#[derive(Debug, Default)]
struct PipeState {
    used: usize,
    generation: u64,
    paused: bool,
    held: VecDeque<Bytes>,
    busy_writes: usize,
    recording: bool,
    recorded: Vec<Frame>,
}

/// One direction: a bounded FIFO drained by a pump thread.
#[derive(Debug)]
struct Pipe {
    capacity: u16,
    state: Mutex<PipeState>,
    queue: Sender<(u64, Bytes)>,
    reader: OnceLock<WeakTransport>,
    writer: OnceLock<WeakTransport>,
}

impl Pipe {
    fn spawn(name: &str, capacity: u16) -> io::Result<Arc<Self>> {
        let (queue, pending) = unbounded::<(u64, Bytes)>();
        let pipe = Arc::new(Self {
            capacity,
            state: Mutex::new(PipeState::default()),
            queue,
            reader: OnceLock::new(),
            writer: OnceLock::new(),
        });
        let weak: Weak<Self> = Arc::downgrade(&pipe);
        thread::Builder::new()
            .name(format!("{name}-pump"))
            .spawn(move || {
                for (generation, buf) in pending {
                    let Some(pipe) = weak.upgrade() else { break };
                    pipe.deliver(generation, buf);
                }
                trace!("loopback pump exiting");
            })?;
        Ok(pipe)
    }

    fn deliver(&self, generation: u64, buf: Bytes) {
        let words = buf.len() / WORD_SIZE;
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.used = state.used.saturating_sub(words);
        }
        if let Some(reader) = self.reader.get().and_then(WeakTransport::upgrade) {
            reader.handle_event(LinkEvent::DataAvailable(buf));
        }
        if let Some(writer) = self.writer.get().and_then(WeakTransport::upgrade) {
            writer.handle_event(LinkEvent::SpaceFreed);
        }
    }

    fn push(&self, data: &[u8]) -> std::result::Result<(), LinkError> {
        let words = data.len() / WORD_SIZE;
        let mut state = self.state.lock();
        if state.busy_writes > 0 {
            state.busy_writes -= 1;
            return Err(LinkError::Busy);
        }
        let free = usize::from(self.capacity) - state.used;
        if words > free {
            return Err(LinkError::Overrun { words, free });
        }
        state.used += words;

        let buf = Bytes::copy_from_slice(data);
        if state.recording {
            let frames = FrameIter::new(buf.clone()).filter_map(std::result::Result::ok);
            state.recorded.extend(frames);
        }
        if state.paused {
            state.held.push_back(buf);
            return Ok(());
        }
        self.queue
            .send((state.generation, buf))
            .map_err(|_| LinkError::Disconnected)
    }

    fn free_words(&self) -> u16 {
        let used = self.state.lock().used;
        u16::try_from(usize::from(self.capacity).saturating_sub(used)).unwrap_or(0)
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        let generation = state.generation;
        for buf in state.held.drain(..) {
            // Pump gone means the pipe is being torn down.
            let _ = self.queue.send((generation, buf));
        }
    }

    /// Forget everything in flight.
    fn flush(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.used = 0;
        state.held.clear();
    }
}

/// One side's view of the loopback: writes into one pipe, sizes the other.
#[derive(Debug)]
pub struct LoopbackLink {
    outbound: Arc<Pipe>,
    inbound_capacity: u16,
}

impl Link for LoopbackLink {
    fn write(&self, data: &[u8]) -> std::result::Result<(), LinkError> {
        self.outbound.push(data)
    }

    fn read_register(&self, register: Register) -> std::result::Result<u32, LinkError> {
        let raw = match register {
            Register::FifoSize => FifoSize {
                inbound: self.inbound_capacity,
                outbound: self.outbound.capacity,
            }
            .to_raw(),
            Register::FifoFill => FifoFill {
                rx_avail: 0,
                tx_avail: self.outbound.free_words(),
            }
            .to_raw(),
        };
        Ok(raw)
    }
}

impl LoopbackLink {
    /// Hold written buffers instead of delivering them.
    pub fn pause(&self) {
        self.outbound.state.lock().paused = true;
    }

    /// Deliver held buffers and go back to immediate delivery.
    pub fn resume(&self) {
        self.outbound.resume();
    }

    /// Fail the next `count` writes with [`LinkError::Busy`].
    pub fn inject_busy(&self, count: usize) {
        self.outbound.state.lock().busy_writes += count;
    }

    /// Start or stop decoding every written frame for later inspection.
    pub fn set_recording(&self, on: bool) {
        self.outbound.state.lock().recording = on;
    }

    /// Frames written since recording started, oldest first.
    #[must_use]
    pub fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut self.outbound.state.lock().recorded)
    }

    /// Words written but not yet drained by the peer.
    #[must_use]
    pub fn used_words(&self) -> usize {
        self.outbound.state.lock().used
    }
}

/// Two transports connected back to back.
#[derive(Debug)]
pub struct LoopbackPair {
    /// First side
    pub a: Transport,
    /// Second side
    pub b: Transport,
    /// Link `a` writes through
    pub a_link: Arc<LoopbackLink>,
    /// Link `b` writes through
    pub b_link: Arc<LoopbackLink>,
}

impl LoopbackPair {
    /// Build both transports, each direction a FIFO of `fifo_words` words.
    ///
    /// Both sides start in reset; call [`LoopbackPair::link_up`].
    pub fn new(fifo_words: u16, config_a: TransportConfig, config_b: TransportConfig) -> Result<Self> {
        let a_to_b = Pipe::spawn(&config_a.name, fifo_words)?;
        let b_to_a = Pipe::spawn(&config_b.name, fifo_words)?;
        let a_link = Arc::new(LoopbackLink {
            outbound: Arc::clone(&a_to_b),
            inbound_capacity: fifo_words,
        });
        let b_link = Arc::new(LoopbackLink {
            outbound: Arc::clone(&b_to_a),
            inbound_capacity: fifo_words,
        });

        let a = Transport::new(a_link.clone(), config_a)?;
        let b = Transport::new(b_link.clone(), config_b)?;
        // Freshly created locks are empty, so these cannot fail.
        let _ = a_to_b.writer.set(a.downgrade());
        let _ = a_to_b.reader.set(b.downgrade());
        let _ = b_to_a.writer.set(b.downgrade());
        let _ = b_to_a.reader.set(a.downgrade());

        Ok(Self {
            a,
            b,
            a_link,
            b_link,
        })
    }

    /// Report every ready condition to both sides.
    pub fn link_up(&self) {
        for event in [
            LinkEvent::ApplicationRunning,
            LinkEvent::InboundFifoReady,
            LinkEvent::OutboundFifoReady,
            LinkEvent::ControlReady,
        ] {
            self.a.handle_event(event.clone());
            self.b.handle_event(event);
        }
    }

    /// Drop everything in flight and reset both sides.
    pub fn reset(&self) {
        self.a_link.outbound.flush();
        self.b_link.outbound.flush();
        self.a.handle_event(LinkEvent::Reset);
        self.b.handle_event(LinkEvent::Reset);
    }
}
