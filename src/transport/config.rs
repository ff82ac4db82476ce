//! Transport configuration

use std::time::Duration;

use crate::protocol::{CHUNK_ALIGNMENT, Features, FRAME_ALIGNMENT};

use super::error::{Error, Result};

/// A batch of receive intents allocated when a channel becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntentPool {
    /// Size of each intent in bytes
    pub size: usize,
    /// Number of intents
    pub count: usize,
}

/// Transport configuration options.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// Edge name used for worker thread names and log fields.
    pub name: String,
    /// Bound on each of the two open handshake waits.
    pub open_timeout: Duration,
    /// Bound on the CLOSE_ACK wait.
    pub close_timeout: Duration,
    /// Bound on the intent request ack wait and on the following intent arrival.
    pub intent_request_timeout: Duration,
    /// Bound on a blocking send waiting for transmit credit.
    pub credit_timeout: Duration,
    /// Back-off after the link reports busy.
    pub tx_retry_backoff: Duration,
    /// Longest single sleep of a credit-starved sender before it re-checks.
    pub credit_poll_interval: Duration,
    /// Intents allocated and advertised when a channel becomes ready.
    pub default_intents: Vec<IntentPool>,
    /// Largest message accepted by `send`.
    pub max_message_size: usize,
    /// Largest intent this side allocates on a peer's request.
    pub max_intent_size: usize,
    /// Largest payload carried by one TX_DATA frame.
    pub max_chunk_size: usize,
    /// Features offered during version negotiation.
    pub features: Features,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "chanmux".to_owned(),
            open_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            intent_request_timeout: Duration::from_secs(10),
            credit_timeout: Duration::from_secs(10),
            tx_retry_backoff: Duration::from_micros(500),
            credit_poll_interval: Duration::from_micros(500),
            default_intents: vec![IntentPool {
                size: 1024,
                count: 5,
            }],
            max_message_size: 64 * 1024,
            max_intent_size: 64 * 1024,
            max_chunk_size: 1024,
            features: Features::SUPPORTED,
        }
    }
}

impl TransportConfig {
    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 || u32::try_from(self.max_message_size).is_err() {
            return Err(Error::InvalidConfig("max_message_size must fit in 1..=u32::MAX"));
        }
        if u32::try_from(self.max_intent_size).is_err() {
            return Err(Error::InvalidConfig("max_intent_size must fit in u32"));
        }
        if self.max_chunk_size < FRAME_ALIGNMENT || self.max_chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(
                "max_chunk_size must be a multiple of 4 and at least 16",
            ));
        }
        if self
            .default_intents
            .iter()
            .any(|pool| pool.size == 0 || pool.size > self.max_intent_size)
        {
            return Err(Error::InvalidConfig(
                "default intent sizes must be in 1..=max_intent_size",
            ));
        }
        if self.credit_poll_interval.is_zero() {
            return Err(Error::InvalidConfig("credit_poll_interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.open_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_secs(2));
        assert_eq!(
            config.default_intents,
            vec![IntentPool {
                size: 1024,
                count: 5
            }]
        );
    }

    #[test]
    fn unaligned_chunk_size_is_rejected() {
        let config = TransportConfig {
            max_chunk_size: 18,
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn oversized_default_intent_is_rejected() {
        let config = TransportConfig {
            default_intents: vec![IntentPool {
                size: 1 << 20,
                count: 1,
            }],
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
