//! Opcodes, feature flags and signal bits

use std::fmt;

/// Command opcodes carried in the first header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Announce protocol version and features
    Version = 0,
    /// Accept a version announcement
    VersionAck = 1,
    /// Open a named channel
    Open = 2,
    /// Close a channel
    Close = 3,
    /// Acknowledge an open
    OpenAck = 4,
    /// Acknowledge a close
    CloseAck = 5,
    /// Advertise receive intents
    Intent = 6,
    /// Receive completed, intent released
    RxDone = 7,
    /// Receive completed, intent kept for reuse
    RxDoneWithReuse = 8,
    /// Ask the peer for an intent of a given size
    IntentRequest = 9,
    /// Answer an intent request
    IntentRequestAck = 10,
    /// First bulk chunk of a message
    TxData = 11,
    /// Continuation bulk chunk
    TxDataCont = 12,
    /// Ask the peer to report freed FIFO space
    ReadNotify = 13,
    /// Modem-style signal update
    Signals = 14,
    /// Small inline payload
    TxShortData = 17,
}

impl Opcode {
    /// Convert from the raw header value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Version),
            1 => Some(Self::VersionAck),
            2 => Some(Self::Open),
            3 => Some(Self::Close),
            4 => Some(Self::OpenAck),
            5 => Some(Self::CloseAck),
            6 => Some(Self::Intent),
            7 => Some(Self::RxDone),
            8 => Some(Self::RxDoneWithReuse),
            9 => Some(Self::IntentRequest),
            10 => Some(Self::IntentRequestAck),
            11 => Some(Self::TxData),
            12 => Some(Self::TxDataCont),
            13 => Some(Self::ReadNotify),
            14 => Some(Self::Signals),
            17 => Some(Self::TxShortData),
            _ => None,
        }
    }

    /// Convert to the raw header value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Opcodes handed to the slow-path worker instead of being handled inline
    #[must_use]
    pub const fn is_deferred(self) -> bool {
        matches!(self, Self::Open | Self::Close | Self::CloseAck)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Version => "VERSION",
            Self::VersionAck => "VERSION_ACK",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::OpenAck => "OPEN_ACK",
            Self::CloseAck => "CLOSE_ACK",
            Self::Intent => "INTENT",
            Self::RxDone => "RX_DONE",
            Self::RxDoneWithReuse => "RX_DONE_W_REUSE",
            Self::IntentRequest => "INTENT_REQ",
            Self::IntentRequestAck => "INTENT_REQ_ACK",
            Self::TxData => "TX_DATA",
            Self::TxDataCont => "TX_DATA_CONT",
            Self::ReadNotify => "READ_NOTIF",
            Self::Signals => "SIGNALS",
            Self::TxShortData => "TX_SHORT_DATA",
        };
        write!(f, "{name}")
    }
}

/// Negotiated transport features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Features(u32);

impl Features {
    /// Receive intents may be marked reusable
    pub const INTENT_REUSE: u32 = 1 << 0;

    /// Every feature this implementation understands
    pub const SUPPORTED: Self = Self(Self::INTENT_REUSE);

    /// No features
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Features supported by both sides
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Check if a feature bit is set
    #[must_use]
    pub const fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

/// Modem-control style signal bits in their generic encoding.
///
/// The wire uses different bit positions; see [`Signals::to_native`] and
/// [`Signals::from_native`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Signals(u32);

impl Signals {
    /// Data terminal ready
    pub const DTR: u32 = 0x002;
    /// Request to send
    pub const RTS: u32 = 0x004;
    /// Clear to send
    pub const CTS: u32 = 0x020;
    /// Carrier detect
    pub const CD: u32 = 0x040;
    /// Ring indicator
    pub const RI: u32 = 0x080;
    /// Data set ready
    pub const DSR: u32 = 0x100;
    /// Bits that belong to the generic encoding
    pub const MASK: u32 = 0x0fff;

    const NATIVE_DTR: u32 = 1 << 31;
    const NATIVE_CTS: u32 = 1 << 30;
    const NATIVE_CD: u32 = 1 << 29;
    const NATIVE_RI: u32 = 1 << 28;

    /// No signals asserted
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from generic bits, dropping anything outside [`Signals::MASK`]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw generic bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if a signal is asserted
    #[must_use]
    pub const fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    /// Assert `set` and drop `clear`
    #[must_use]
    pub const fn update(self, set: u32, clear: u32) -> Self {
        Self::from_bits((self.0 | set) & !clear)
    }

    /// Encode for the wire. RTS is carried in the CTS position.
    #[must_use]
    pub const fn to_native(self) -> u32 {
        let mut native = self.0;
        if self.0 & Self::DTR != 0 {
            native |= Self::NATIVE_DTR;
        }
        if self.0 & Self::RTS != 0 {
            native |= Self::NATIVE_CTS;
        }
        if self.0 & Self::CD != 0 {
            native |= Self::NATIVE_CD;
        }
        if self.0 & Self::RI != 0 {
            native |= Self::NATIVE_RI;
        }
        native
    }

    /// Decode a peer's native bits. The peer's DTR shows up here as DSR.
    #[must_use]
    pub const fn from_native(native: u32) -> Self {
        let mut bits = native;
        if native & Self::NATIVE_DTR != 0 {
            bits |= Self::DSR;
        }
        if native & Self::NATIVE_CTS != 0 {
            bits |= Self::CTS;
        }
        if native & Self::NATIVE_CD != 0 {
            bits |= Self::CD;
        }
        if native & Self::NATIVE_RI != 0 {
            bits |= Self::RI;
        }
        Self::from_bits(bits)
    }
}

impl fmt::Display for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip_skips_gaps() {
        for raw in 0u16..=20 {
            match Opcode::from_u16(raw) {
                Some(op) => assert_eq!(op.as_u16(), raw),
                None => assert!(matches!(raw, 15 | 16 | 18..=20)),
            }
        }
    }

    #[test]
    fn only_open_close_paths_are_deferred() {
        assert!(Opcode::Open.is_deferred());
        assert!(Opcode::Close.is_deferred());
        assert!(Opcode::CloseAck.is_deferred());
        assert!(!Opcode::OpenAck.is_deferred());
        assert!(!Opcode::TxData.is_deferred());
    }

    #[test]
    fn outbound_signals_map_to_native_positions() {
        let local = Signals::from_bits(Signals::DTR | Signals::RTS);
        let native = local.to_native();
        assert_eq!(native & 0xf000_0000, (1 << 31) | (1 << 30));
    }

    #[test]
    fn inbound_dtr_becomes_dsr() {
        let native = Signals::from_bits(Signals::DTR | Signals::RTS).to_native();
        let remote = Signals::from_native(native);
        assert!(remote.contains(Signals::DSR));
        assert!(remote.contains(Signals::CTS));
        assert_eq!(remote.bits() & !Signals::MASK, 0);
    }

    #[test]
    fn update_sets_then_clears() {
        let sigs = Signals::from_bits(Signals::DTR).update(Signals::RTS | Signals::CD, Signals::DTR);
        assert_eq!(sigs.bits(), Signals::RTS | Signals::CD);
    }

    #[test]
    fn features_intersect() {
        let ours = Features::SUPPORTED;
        let theirs = Features::from_bits(0);
        assert!(!ours.intersect(theirs).contains(Features::INTENT_REUSE));
        assert!(ours.contains(Features::INTENT_REUSE));
    }
}
