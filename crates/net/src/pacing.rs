//! Scheduled chunk sends.
//!
//! Instead of sleeping between sends, every pending chunk carries a
//! `ready_at` time. The host polls the queue once per tick and sends whatever
//! is due. A send the transport refuses goes back in with a short backoff.

use colonysync_core::config::TransferConfig;
use colonysync_core::PeerId;
use std::time::{Duration, Instant};
use tracing::trace;

/// One chunk waiting for its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Receiving peer.
    pub peer: PeerId,
    /// Transfer session id.
    pub transfer_id: String,
    /// Chunk index.
    pub sequence: i32,
    /// Earliest send time.
    pub ready_at: Instant,
    /// Times the transport refused this send.
    pub attempts: u32,
}

/// Time-ordered queue of pending chunk sends.
#[derive(Debug, Clone)]
pub struct PacedQueue {
    entries: Vec<PendingSend>,
    chunks_per_step: usize,
    step_interval: Duration,
    retry_backoff: Duration,
}

impl PacedQueue {
    /// Queue paced by the transfer settings.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            entries: Vec::new(),
            chunks_per_step: config.chunks_per_tick.max(1),
            step_interval: config.send_interval(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Pending sends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest `ready_at`, if any.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.ready_at)
    }

    fn insert(&mut self, entry: PendingSend) {
        // Equal times keep insertion order.
        let at = self
            .entries
            .partition_point(|e| e.ready_at <= entry.ready_at);
        self.entries.insert(at, entry);
    }

    /// Schedule `sequences` in groups, one group per step starting at `now`.
    pub fn schedule<I>(&mut self, peer: PeerId, transfer_id: &str, sequences: I, now: Instant)
    where
        I: IntoIterator<Item = i32>,
    {
        let mut scheduled = 0usize;
        for (i, sequence) in sequences.into_iter().enumerate() {
            let step = (i / self.chunks_per_step) as u32;
            self.insert(PendingSend {
                peer,
                transfer_id: transfer_id.to_string(),
                sequence,
                ready_at: now + self.step_interval * step,
                attempts: 0,
            });
            scheduled += 1;
        }
        trace!("Scheduled {} chunk(s) of {} for {}", scheduled, transfer_id, peer);
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<PendingSend> {
        let due = self.entries.partition_point(|e| e.ready_at <= now);
        self.entries.drain(..due).collect()
    }

    /// Put back a send the transport refused, due after the backoff.
    pub fn retry(&mut self, mut entry: PendingSend, now: Instant) {
        entry.attempts += 1;
        entry.ready_at = now + self.retry_backoff;
        self.insert(entry);
    }

    /// Drop everything pending for `peer`.
    pub fn drop_peer(&mut self, peer: PeerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.peer != peer);
        before - self.entries.len()
    }

    /// Drop everything pending for one transfer.
    pub fn drop_transfer(&mut self, peer: PeerId, transfer_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.peer == peer && e.transfer_id == transfer_id));
        before - self.entries.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
