//! Paced, acknowledged snapshot delivery.
//!
//! Combines the [`TransferTracker`] (what each peer has acknowledged) with the
//! [`PacedQueue`] (when each first send is due). The session calls
//! [`BulkSender::pump`] once per tick with a send callback.

use colonysync_core::config::TransferConfig;
use colonysync_core::PeerId;
use colonysync_net::protocol::{ChunkAck, ChunkResendRequest, SecureTransfer};
use colonysync_net::{AckOutcome, Packet, PacedQueue, TransferTracker, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// What one [`BulkSender::pump`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// First sends that left.
    pub sent: usize,
    /// Stale chunks resent by the sweep.
    pub resent: usize,
    /// Sends pushed back because the transport queue was full.
    pub deferred: usize,
    /// Sends dropped because the peer was gone.
    pub failed: usize,
    /// Idle transfers abandoned.
    pub reaped: usize,
}

/// Host-side bulk transfer driver.
#[derive(Debug)]
pub struct BulkSender {
    tracker: TransferTracker,
    queue: PacedQueue,
    rng: StdRng,
}

impl BulkSender {
    /// Sender with entropy-seeded transfer ids.
    pub fn new(config: &TransferConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Sender with reproducible transfer ids.
    pub fn with_seed(config: &TransferConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &TransferConfig, rng: StdRng) -> Self {
        Self {
            tracker: TransferTracker::new(config),
            queue: PacedQueue::new(config),
            rng,
        }
    }

    /// Acknowledgment state.
    pub fn tracker(&self) -> &TransferTracker {
        &self.tracker
    }

    /// First sends still waiting for their slot.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue `payload` for `peer` under a new transfer id, returned.
    pub fn start(
        &mut self,
        peer: PeerId,
        file_name: &str,
        payload: Arc<[u8]>,
        now: Instant,
    ) -> String {
        let transfer_id = format!("{:016x}", self.rng.gen::<u64>());
        let total = self
            .tracker
            .start_transfer(peer, &transfer_id, file_name, payload, now);
        self.queue.schedule(peer, &transfer_id, 0..total as i32, now);
        transfer_id
    }

    /// Send whatever is due, sweep for lost chunks, and reap idle transfers.
    pub fn pump<F>(&mut self, now: Instant, mut send: F) -> PumpReport
    where
        F: FnMut(PeerId, Packet) -> Result<(), TransportError>,
    {
        let mut report = PumpReport::default();

        for entry in self.queue.pop_ready(now) {
            if self
                .tracker
                .is_settled(entry.peer, &entry.transfer_id, entry.sequence)
            {
                continue;
            }
            let Some(chunk) =
                self.tracker
                    .build_chunk(entry.peer, &entry.transfer_id, entry.sequence)
            else {
                continue;
            };
            match send(entry.peer, Packet::SecureTransfer(chunk)) {
                Ok(()) => {
                    trace!(
                        "Sent chunk {} of {} to {}",
                        entry.sequence,
                        entry.transfer_id,
                        entry.peer
                    );
                    self.tracker
                        .mark_sent(entry.peer, &entry.transfer_id, entry.sequence, now);
                    report.sent += 1;
                }
                Err(TransportError::QueueFull(_)) => {
                    self.queue.retry(entry, now);
                    report.deferred += 1;
                }
                Err(e) => {
                    debug!(
                        "Send of chunk {} of {} to {} failed: {}; leaving it to the sweep",
                        entry.sequence, entry.transfer_id, entry.peer, e
                    );
                    self.tracker
                        .mark_sent(entry.peer, &entry.transfer_id, entry.sequence, now);
                    report.failed += 1;
                }
            }
        }

        for item in self.tracker.check_for_lost_chunks(now) {
            let Some(chunk) = self
                .tracker
                .build_chunk(item.peer, &item.transfer_id, item.sequence)
            else {
                continue;
            };
            match send(item.peer, Packet::SecureTransfer(chunk)) {
                Ok(()) => report.resent += 1,
                Err(e) => {
                    debug!(
                        "Resend of chunk {} of {} to {} failed: {}",
                        item.sequence, item.transfer_id, item.peer, e
                    );
                    report.failed += 1;
                }
            }
        }

        for (peer, transfer_id) in self.tracker.reap_idle(now) {
            self.queue.drop_transfer(peer, &transfer_id);
            report.reaped += 1;
        }
        report
    }

    /// Apply an acknowledgment from `peer`.
    pub fn on_ack(&mut self, peer: PeerId, ack: &ChunkAck, now: Instant) -> AckOutcome {
        let outcome = self
            .tracker
            .handle_ack(peer, &ack.transfer_id, ack.sequence, now);
        if outcome == AckOutcome::Completed {
            self.queue.drop_transfer(peer, &ack.transfer_id);
        }
        outcome
    }

    /// Chunk to resend after the peer's integrity check failed.
    pub fn on_resend_request(
        &mut self,
        peer: PeerId,
        request: &ChunkResendRequest,
        now: Instant,
    ) -> Option<SecureTransfer> {
        self.tracker
            .resend_request(peer, &request.transfer_id, request.sequence, now)
    }

    /// Peer's connection closed: freeze its transfers and drop pending sends.
    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.tracker.pause_peer(peer);
        let dropped = self.queue.drop_peer(peer);
        if dropped > 0 {
            debug!("Dropped {} pending chunk send(s) for {}", dropped, peer);
        }
    }

    /// Peer is back: resume its transfers and reschedule never-sent chunks.
    pub fn on_reconnect(&mut self, peer: PeerId, now: Instant) {
        for (transfer_id, unsent) in self.tracker.resume_peer(peer, now) {
            self.queue.schedule(peer, &transfer_id, unsent, now);
        }
    }

    /// Forget every transfer to `peer`.
    pub fn cancel_peer(&mut self, peer: PeerId) -> usize {
        self.queue.drop_peer(peer);
        self.tracker.cancel_peer(peer)
    }

    /// Forget everything (host shutdown).
    pub fn shutdown(&mut self) -> usize {
        self.queue.clear();
        self.tracker.cancel_all()
    }
}
