use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Live counters of one [`crate::ConnectorChannel`].
///
/// Timestamps are milliseconds since the Unix epoch; zero means "never".
#[derive(Debug)]
pub struct ChannelStatistics {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    malformed_messages_received: AtomicU64,
    receive_errors: AtomicU64,
    send_errors: AtomicU64,
    last_message_received: AtomicU64,
    last_message_sent: AtomicU64,
    statistics_reset: AtomicU64,
    connected: u64,
    connected_instant: Instant,
}

/// Point-in-time copy of [`ChannelStatistics`], serialized as JSON by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatisticsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub malformed_messages_received: u64,
    pub receive_errors: u64,
    pub send_errors: u64,
    pub last_message_received: Option<u64>,
    pub last_message_sent: Option<u64>,
    pub statistics_reset: u64,
    pub connected: u64,
    pub uptime_secs: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn optional(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

impl ChannelStatistics {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            malformed_messages_received: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            last_message_received: AtomicU64::new(0),
            last_message_sent: AtomicU64::new(0),
            statistics_reset: AtomicU64::new(now),
            connected: now,
            connected_instant: Instant::now(),
        }
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_message_sent.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_received.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter. Connection time and uptime are kept.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_received,
            &self.bytes_sent,
            &self.messages_received,
            &self.messages_sent,
            &self.malformed_messages_received,
            &self.receive_errors,
            &self.send_errors,
            &self.last_message_received,
            &self.last_message_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.statistics_reset.store(now_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatisticsSnapshot {
        ChannelStatisticsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            malformed_messages_received: self.malformed_messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            last_message_received: optional(self.last_message_received.load(Ordering::Relaxed)),
            last_message_sent: optional(self.last_message_sent.load(Ordering::Relaxed)),
            statistics_reset: self.statistics_reset.load(Ordering::Relaxed),
            connected: self.connected,
            uptime_secs: self.connected_instant.elapsed().as_secs(),
        }
    }
}

impl Default for ChannelStatistics {
    fn default() -> Self {
        Self::new()
    }
}
