//! chanmux - Multiplexed named channels over a credit-limited word FIFO
//!
//! Two processors share a pair of hardware FIFOs. This crate runs many
//! independent, named, bidirectional message channels over that single
//! link: channels are opened by name from either side, the receiver
//! advertises buffers ("intents") before the sender may write, and every
//! write is paced by the words free in the peer's FIFO.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chanmux::{ChannelCallbacks, LoopbackPair, TransportConfig};
//!
//! let pair = LoopbackPair::new(1024, TransportConfig::default(), TransportConfig::default())?;
//! pair.link_up();
//!
//! let a = pair.a.clone();
//! let opener = std::thread::spawn(move || a.open("ping", ChannelCallbacks::new()));
//! let pong = pair.b.open(
//!     "ping",
//!     ChannelCallbacks::new().on_receive(|msg| println!("got {} bytes", msg.len())),
//! )?;
//! let ping = opener.join().expect("opener thread")?;
//!
//! ping.send(b"hello over the FIFO")?;
//! # drop(pong);
//! # Ok::<(), chanmux::Error>(())
//! ```
//!
//! # Layout
//!
//! - [`protocol`] - frame layouts, encoding and decoding; no I/O
//! - [`transport`] - channel tables, handshakes, intents, credit and the
//!   [`Link`] boundary to the FIFO driver

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod protocol;
pub mod transport;

pub use protocol::{DecodeError, Features, Frame, FrameIter, Opcode, Signals};
pub use transport::{
    ChannelCallbacks, ChannelInfo, ChannelState, Endpoint, Error, IntentPool, Link, LinkError,
    LinkEvent, LoopbackLink, LoopbackPair, Result, Transport, TransportConfig,
};

/// Wire protocol version spoken by this crate
pub const VERSION: u16 = protocol::PROTOCOL_VERSION;
