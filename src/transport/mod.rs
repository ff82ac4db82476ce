//! Channel transport over a credit-limited word FIFO

mod channel;
mod config;
mod credit;
mod dispatch;
mod endpoint;
mod error;
mod ids;
mod intent;
mod lifecycle;
mod link;
mod loopback;
mod metrics;
mod reset;
mod sync;
mod transport;
mod worker;

pub use channel::{ChannelCallbacks, ChannelState};
pub use config::{IntentPool, TransportConfig};
pub use endpoint::Endpoint;
pub use error::{Error, LinkError, Operation, Result};
pub use link::{FifoFill, FifoSize, Link, LinkEvent, LinkFault, Register};
pub use loopback::{LoopbackLink, LoopbackPair};
pub use metrics::MetricsSnapshot;
pub use transport::{ChannelInfo, Transport, WeakTransport};
