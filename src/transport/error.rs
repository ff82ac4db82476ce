//! Transport-level error types covering link, handshake, and intent failures.

use std::fmt;

use thiserror::Error;

/// Blocking operation that can run out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Waiting for OPEN_ACK or the peer's OPEN
    Open,
    /// Waiting for CLOSE_ACK
    Close,
    /// Waiting for INTENT_REQUEST_ACK
    IntentRequest,
    /// Waiting for a granted intent to arrive
    IntentArrival,
    /// Waiting for transmit credit
    Credit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open handshake",
            Self::Close => "close handshake",
            Self::IntentRequest => "intent request",
            Self::IntentArrival => "intent arrival",
            Self::Credit => "transmit credit",
        };
        f.write_str(name)
    }
}

/// Failure reported by a [`Link`](super::Link) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The link is momentarily busy; retry after a short back-off
    #[error("link busy")]
    Busy,
    /// Write would overrun the peer FIFO
    #[error("write of {words} words overruns FIFO ({free} free)")]
    Overrun {
        /// Words the caller tried to write
        words: usize,
        /// Words actually free
        free: usize,
    },
    /// The link is gone
    #[error("link disconnected")]
    Disconnected,
    /// Other device failure
    #[error("link failure: {0}")]
    Other(String),
}

/// Unified error type for channel transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No credit or no intent right now; try again
    #[error("operation would block")]
    WouldBlock,

    /// A bounded wait ran out
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: Operation,
    },

    /// The link went down; everything outstanding was torn down
    #[error("connection reset by link")]
    ConnectionReset,

    /// The channel is not open (closed locally, by the peer, or never opened)
    #[error("channel closed")]
    ChannelClosed,

    /// The peer refused to allocate a receive intent
    #[error("peer rejected intent request for {size} bytes")]
    IntentRejected {
        /// Requested size
        size: usize,
    },

    /// A receive buffer could not be allocated
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size
        size: usize,
    },

    /// Message is empty or larger than allowed
    #[error("message size {len} outside 1..={max}")]
    MessageSize {
        /// Message length
        len: usize,
        /// Largest accepted length
        max: usize,
    },

    /// Channel name cannot be carried on the wire
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidName {
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// This side already has the channel open
    #[error("channel {0:?} already open")]
    AlreadyOpen(String),

    /// Every local channel id is taken
    #[error("no free local channel ids")]
    IdsExhausted,

    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Link adapter failure
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Worker thread could not be started
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same call later can succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Link(LinkError::Busy))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
