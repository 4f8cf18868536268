//! Packet and byte counters with per-second rates.

use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Traffic counters for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    /// Packets handed to the transport.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Bytes sent during the last full second.
    pub sent_bytes_per_sec: u64,
    /// Bytes received during the last full second.
    pub received_bytes_per_sec: u64,

    window_sent: u64,
    window_received: u64,
    window_start: Option<Instant>,
}

impl BandwidthStats {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outgoing packet.
    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        self.window_sent += bytes as u64;
    }

    /// Count one incoming packet.
    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
        self.window_received += bytes as u64;
    }

    /// Publish the current window as the per-second rate once a second has
    /// elapsed.
    pub fn roll(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed < RATE_WINDOW {
            return;
        }
        // An idle gap of several seconds means the last full second was empty.
        if elapsed < RATE_WINDOW * 2 {
            self.sent_bytes_per_sec = self.window_sent;
            self.received_bytes_per_sec = self.window_received;
        } else {
            self.sent_bytes_per_sec = 0;
            self.received_bytes_per_sec = 0;
        }
        self.window_sent = 0;
        self.window_received = 0;
        self.window_start = Some(now);
    }
}
