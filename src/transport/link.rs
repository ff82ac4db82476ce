//! Boundary to the physical FIFO link driver

use std::fmt;

use bytes::Bytes;

use super::error::LinkError;

/// Word-oriented FIFO link driven by the transport.
///
/// Implementations move whole frames into the peer's receive FIFO and
/// report link events back through
/// [`Transport::handle_event`](super::Transport::handle_event).
pub trait Link: Send + Sync {
    /// Write `data` to the peer FIFO.
    ///
    /// `data.len()` is always a multiple of the word size. Returning
    /// [`LinkError::Busy`] makes the transport back off and retry.
    fn write(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Read a status register.
    fn read_register(&self, register: Register) -> Result<u32, LinkError>;
}

/// Status registers the transport reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// FIFO capacities, see [`FifoSize`]
    FifoSize,
    /// Current FIFO fill levels, see [`FifoFill`]
    FifoFill,
}

/// FIFO capacities in words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoSize {
    /// Words in this side's receive FIFO
    pub inbound: u16,
    /// Words in the peer's receive FIFO
    pub outbound: u16,
}

impl FifoSize {
    /// Decode the raw register value (inbound in the low half).
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            inbound: (raw & 0xffff) as u16,
            outbound: (raw >> 16) as u16,
        }
    }

    /// Encode as a raw register value.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        (self.inbound as u32) | ((self.outbound as u32) << 16)
    }
}

/// Free FIFO space in words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoFill {
    /// Words waiting in this side's receive FIFO
    pub rx_avail: u16,
    /// Words free in the peer's receive FIFO
    pub tx_avail: u16,
}

impl FifoFill {
    /// Decode the raw register value (`rx_avail` in the low half).
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            rx_avail: (raw & 0xffff) as u16,
            tx_avail: (raw >> 16) as u16,
        }
    }

    /// Encode as a raw register value.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        (self.rx_avail as u32) | ((self.tx_avail as u32) << 16)
    }
}

/// Hardware faults reported by the link. They are logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Write overran the peer FIFO
    WriteOverrun,
    /// Bus error while writing
    WriteBusError,
    /// Read underran the local FIFO
    ReadUnderrun,
    /// Bus error while reading
    ReadBusError,
    /// Access to an illegal address
    IllegalAddress,
    /// Control bus error
    ControlBusError,
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WriteOverrun => "write overrun",
            Self::WriteBusError => "write bus error",
            Self::ReadUnderrun => "read underrun",
            Self::ReadBusError => "read bus error",
            Self::IllegalAddress => "illegal address",
            Self::ControlBusError => "control bus error",
        };
        f.write_str(name)
    }
}

/// Events delivered by the link driver.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The peer application is running
    ApplicationRunning,
    /// This side's receive FIFO is ready
    InboundFifoReady,
    /// The peer's receive FIFO is ready
    OutboundFifoReady,
    /// The control plane is ready
    ControlReady,
    /// Words drained from this side's receive FIFO
    DataAvailable(Bytes),
    /// The peer freed space in its receive FIFO
    SpaceFreed,
    /// The link went down
    Reset,
    /// A hardware fault was observed
    Fault(LinkFault),
}

/// Link-ready sub-conditions tracked until all four are seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LinkStatus(u32);

impl LinkStatus {
    pub(crate) const APPLICATION_RUNNING: u32 = 1 << 0;
    pub(crate) const INBOUND_FIFO_READY: u32 = 1 << 1;
    pub(crate) const OUTBOUND_FIFO_READY: u32 = 1 << 2;
    pub(crate) const CONTROL_READY: u32 = 1 << 3;
    pub(crate) const LINK_UP: u32 = Self::APPLICATION_RUNNING
        | Self::INBOUND_FIFO_READY
        | Self::OUTBOUND_FIFO_READY
        | Self::CONTROL_READY;

    /// Record one condition. Returns `true` on the transition to link-up.
    pub(crate) fn observe(&mut self, bit: u32) -> bool {
        let was_up = self.is_up();
        self.0 |= bit;
        !was_up && self.is_up()
    }

    pub(crate) const fn is_up(self) -> bool {
        self.0 == Self::LINK_UP
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}
