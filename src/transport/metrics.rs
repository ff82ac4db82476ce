use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-transport counters, updated lock-free from every context.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    protocol_errors: AtomicU64,
    read_notifies: AtomicU64,
    credit_stalls: AtomicU64,
    credit_wait_total_ns: AtomicU64,
    credit_wait_max_ns: AtomicU64,
    intent_requests_sent: AtomicU64,
    intent_requests_granted: AtomicU64,
    intent_requests_denied: AtomicU64,
    resets: AtomicU64,
}

/// Which side of an intent request to count.
#[derive(Clone, Copy)]
pub(crate) enum IntentRequestOutcome {
    Sent,
    Granted,
    Denied,
}

impl Metrics {
    #[inline]
    pub(crate) fn record_sent(&self, frames: usize, bytes: usize) {
        self.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_delivery(&self, delivered: bool) {
        if delivered {
            self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_read_notify(&self) {
        self.read_notifies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_credit_stall(&self, waited: Duration) {
        let nanos = waited.as_nanos().try_into().unwrap_or(u64::MAX);
        self.credit_stalls.fetch_add(1, Ordering::Relaxed);
        self.credit_wait_total_ns.fetch_add(nanos, Ordering::Relaxed);
        update_max(&self.credit_wait_max_ns, nanos);
    }

    #[inline]
    pub(crate) fn record_intent_request(&self, outcome: IntentRequestOutcome) {
        let counter = match outcome {
            IntentRequestOutcome::Sent => &self.intent_requests_sent,
            IntentRequestOutcome::Granted => &self.intent_requests_granted,
            IntentRequestOutcome::Denied => &self.intent_requests_denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            read_notifies: self.read_notifies.load(Ordering::Relaxed),
            credit_stalls: self.credit_stalls.load(Ordering::Relaxed),
            credit_wait_total_ns: self.credit_wait_total_ns.load(Ordering::Relaxed),
            credit_wait_max_ns: self.credit_wait_max_ns.load(Ordering::Relaxed),
            intent_requests_sent: self.intent_requests_sent.load(Ordering::Relaxed),
            intent_requests_granted: self.intent_requests_granted.load(Ordering::Relaxed),
            intent_requests_denied: self.intent_requests_denied.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Lightweight snapshot of transport counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub protocol_errors: u64,
    pub read_notifies: u64,
    pub credit_stalls: u64,
    pub credit_wait_total_ns: u64,
    pub credit_wait_max_ns: u64,
    /// Intent requests this side sent to the peer
    pub intent_requests_sent: u64,
    /// Peer requests this side granted
    pub intent_requests_granted: u64,
    /// Peer requests this side denied
    pub intent_requests_denied: u64,
    pub resets: u64,
}

impl MetricsSnapshot {
    /// Average credit stall in microseconds.
    #[must_use]
    pub fn avg_credit_wait_us(&self) -> Option<u64> {
        if self.credit_stalls == 0 {
            return None;
        }
        Some(self.credit_wait_total_ns / self.credit_stalls / 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_tracking_keeps_total_and_max() {
        let metrics = Metrics::default();
        metrics.record_credit_stall(Duration::from_micros(10));
        metrics.record_credit_stall(Duration::from_micros(30));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.credit_stalls, 2);
        assert_eq!(snapshot.credit_wait_max_ns, 30_000);
        assert_eq!(snapshot.avg_credit_wait_us(), Some(20));
    }

    #[test]
    fn deliveries_split_into_delivered_and_dropped() {
        let metrics = Metrics::default();
        metrics.record_delivery(true);
        metrics.record_delivery(false);
        metrics.record_delivery(true);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(MetricsSnapshot::default().avg_credit_wait_us(), None);
    }
}
