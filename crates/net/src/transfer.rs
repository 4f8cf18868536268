//! Sender-side bookkeeping for chunked bulk transfers.
//!
//! One [`OutgoingTransfer`] per `(peer, transfer id)`. Each chunk tracks
//! whether it was sent, when, and whether it was acknowledged. The
//! highest-contiguous-ack cursor only moves over an unbroken acked prefix, and
//! a transfer is finished exactly when that cursor reaches the last chunk.

use crate::protocol::{SecureTransfer, SnapshotChunk};
use colonysync_core::config::TransferConfig;
use colonysync_core::PeerId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// State of one bulk send to one peer.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    /// Receiving peer.
    pub peer: PeerId,
    /// Transfer session id.
    pub transfer_id: String,
    /// Name the receiver files the payload under.
    pub file_name: String,

    payload: Arc<[u8]>,
    chunk_size: usize,
    sent: Vec<bool>,
    acked: Vec<bool>,
    sent_at: Vec<Option<Instant>>,
    highest_contiguous_ack: i32,
    paused: bool,
    started_at: Instant,
    last_activity: Instant,
    resends: u64,
}

impl OutgoingTransfer {
    fn new(
        peer: PeerId,
        transfer_id: String,
        file_name: String,
        payload: Arc<[u8]>,
        chunk_size: usize,
        now: Instant,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        // An empty payload still travels as one empty chunk.
        let total = payload.len().div_ceil(chunk_size).max(1);
        Self {
            peer,
            transfer_id,
            file_name,
            payload,
            chunk_size,
            sent: vec![false; total],
            acked: vec![false; total],
            sent_at: vec![None; total],
            highest_contiguous_ack: -1,
            paused: false,
            started_at: now,
            last_activity: now,
            resends: 0,
        }
    }

    /// Number of chunks.
    pub fn total_chunks(&self) -> usize {
        self.acked.len()
    }

    /// Cursor over the fully delivered prefix; `-1` before the first ack.
    pub fn highest_contiguous_ack(&self) -> i32 {
        self.highest_contiguous_ack
    }

    /// Every chunk acknowledged.
    pub fn is_complete(&self) -> bool {
        self.highest_contiguous_ack + 1 == self.total_chunks() as i32
    }

    /// True while the peer is disconnected.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether chunk `seq` has been sent at least once.
    pub fn is_sent(&self, seq: usize) -> bool {
        self.sent.get(seq).copied().unwrap_or(false)
    }

    /// Whether chunk `seq` has been acknowledged.
    pub fn is_acked(&self, seq: usize) -> bool {
        self.acked.get(seq).copied().unwrap_or(false)
    }

    /// Acknowledged chunk count.
    pub fn acked_count(&self) -> usize {
        self.acked.iter().filter(|a| **a).count()
    }

    /// Chunks resent after a timeout or resend request.
    pub fn resends(&self) -> u64 {
        self.resends
    }

    /// Chunks never sent yet.
    pub fn unsent(&self) -> Vec<i32> {
        self.sent
            .iter()
            .enumerate()
            .filter(|(_, sent)| !**sent)
            .map(|(i, _)| i as i32)
            .collect()
    }

    /// Time since the transfer was queued.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    fn chunk_range(&self, seq: usize) -> (usize, usize) {
        let start = (seq * self.chunk_size).min(self.payload.len());
        let end = (start + self.chunk_size).min(self.payload.len());
        (start, end)
    }

    /// Build the integrity-checked envelope for chunk `seq`.
    pub fn build_chunk(&self, seq: usize) -> Option<SecureTransfer> {
        if seq >= self.total_chunks() {
            return None;
        }
        let (start, end) = self.chunk_range(seq);
        let chunk = SnapshotChunk {
            file_name: self.file_name.clone(),
            offset: start as i32,
            total_size: self.payload.len() as i32,
            data: self.payload[start..end].to_vec(),
        };
        Some(SecureTransfer {
            sequence: seq as i32,
            transfer_id: self.transfer_id.clone(),
            payload: chunk.encode(),
        })
    }

    fn advance_cursor(&mut self) {
        while let Some(true) = self.acked.get((self.highest_contiguous_ack + 1) as usize) {
            self.highest_contiguous_ack += 1;
        }
    }
}

/// Result of feeding one acknowledgment to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// No such transfer (finished, cancelled or never started).
    Unknown,
    /// Sequence number outside the transfer.
    OutOfRange,
    /// Chunk was already acknowledged.
    Duplicate,
    /// Recorded; the transfer continues.
    Advanced {
        /// Cursor after the ack.
        highest_contiguous_ack: i32,
    },
    /// Last outstanding chunk; the transfer was removed.
    Completed,
}

/// A chunk selected for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendItem {
    /// Receiving peer.
    pub peer: PeerId,
    /// Transfer session id.
    pub transfer_id: String,
    /// Chunk index.
    pub sequence: i32,
}

/// Aggregate counters across every transfer the tracker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMetrics {
    /// Transfers queued.
    pub started: u64,
    /// Transfers fully acknowledged.
    pub completed: u64,
    /// Transfers dropped by the idle reaper.
    pub reaped: u64,
    /// Transfers cancelled by a session transition.
    pub cancelled: u64,
    /// Chunks resent.
    pub resends: u64,
    /// Acks for unknown transfers or duplicate chunks.
    pub stray_acks: u64,
}

/// Active transfers keyed by `(peer, transfer id)`.
#[derive(Debug, Clone)]
pub struct TransferTracker {
    transfers: BTreeMap<(PeerId, String), OutgoingTransfer>,
    chunk_size: usize,
    resend_timeout: Duration,
    resend_window: usize,
    idle_timeout: Duration,
    metrics: TransferMetrics,
}

impl TransferTracker {
    /// Tracker using the transfer settings.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            transfers: BTreeMap::new(),
            chunk_size: config.effective_chunk_size(),
            resend_timeout: config.resend_timeout(),
            resend_window: config.resend_window.max(1),
            idle_timeout: config.idle_timeout(),
            metrics: TransferMetrics::default(),
        }
    }

    /// Active transfer count.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Counters.
    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// Look up one transfer.
    pub fn get(&self, peer: PeerId, transfer_id: &str) -> Option<&OutgoingTransfer> {
        self.transfers.get(&(peer, transfer_id.to_string()))
    }

    /// True while `(peer, transfer_id)` is in flight.
    pub fn is_active(&self, peer: PeerId, transfer_id: &str) -> bool {
        self.get(peer, transfer_id).is_some()
    }

    /// Every transfer to `peer`.
    pub fn transfers_for(&self, peer: PeerId) -> impl Iterator<Item = &OutgoingTransfer> {
        self.transfers
            .iter()
            .filter(move |((p, _), _)| *p == peer)
            .map(|(_, t)| t)
    }

    /// Queue a payload for `peer`. Returns the number of chunks.
    ///
    /// A transfer with the same key is replaced.
    pub fn start_transfer(
        &mut self,
        peer: PeerId,
        transfer_id: &str,
        file_name: &str,
        payload: Arc<[u8]>,
        now: Instant,
    ) -> usize {
        let transfer = OutgoingTransfer::new(
            peer,
            transfer_id.to_string(),
            file_name.to_string(),
            payload,
            self.chunk_size,
            now,
        );
        let total = transfer.total_chunks();
        info!(
            "Starting transfer {} of {} to {}: {} chunks",
            transfer_id, file_name, peer, total
        );
        if self
            .transfers
            .insert((peer, transfer_id.to_string()), transfer)
            .is_some()
        {
            warn!("Replaced existing transfer {} to {}", transfer_id, peer);
        }
        self.metrics.started += 1;
        total
    }

    /// Envelope for one chunk of an active transfer.
    pub fn build_chunk(&self, peer: PeerId, transfer_id: &str, seq: i32) -> Option<SecureTransfer> {
        let seq = usize::try_from(seq).ok()?;
        self.get(peer, transfer_id)?.build_chunk(seq)
    }

    /// Record that chunk `seq` left the host at `now`.
    pub fn mark_sent(&mut self, peer: PeerId, transfer_id: &str, seq: i32, now: Instant) {
        let Some(transfer) = self.transfers.get_mut(&(peer, transfer_id.to_string())) else {
            return;
        };
        let Ok(idx) = usize::try_from(seq) else {
            return;
        };
        if idx >= transfer.total_chunks() {
            return;
        }
        transfer.sent[idx] = true;
        transfer.sent_at[idx] = Some(now);
        transfer.last_activity = now;
    }

    /// True if chunk `seq` no longer needs sending (acked or transfer gone).
    pub fn is_settled(&self, peer: PeerId, transfer_id: &str, seq: i32) -> bool {
        match (self.get(peer, transfer_id), usize::try_from(seq)) {
            (Some(transfer), Ok(idx)) => idx >= transfer.total_chunks() || transfer.acked[idx],
            _ => true,
        }
    }

    /// Apply an acknowledgment. Out-of-order acks are fine.
    pub fn handle_ack(
        &mut self,
        peer: PeerId,
        transfer_id: &str,
        seq: i32,
        now: Instant,
    ) -> AckOutcome {
        let key = (peer, transfer_id.to_string());
        let Some(transfer) = self.transfers.get_mut(&key) else {
            trace!("Ack {} for unknown transfer {} from {}", seq, transfer_id, peer);
            self.metrics.stray_acks += 1;
            return AckOutcome::Unknown;
        };
        let idx = match usize::try_from(seq) {
            Ok(idx) if idx < transfer.total_chunks() => idx,
            _ => {
                warn!(
                    "Ack {} outside transfer {} ({} chunks) from {}",
                    seq,
                    transfer_id,
                    transfer.total_chunks(),
                    peer
                );
                return AckOutcome::OutOfRange;
            }
        };

        transfer.last_activity = now;
        if transfer.acked[idx] {
            self.metrics.stray_acks += 1;
            return AckOutcome::Duplicate;
        }
        transfer.acked[idx] = true;
        transfer.advance_cursor();
        trace!(
            "Ack {} on {} from {}; contiguous through {}",
            seq,
            transfer_id,
            peer,
            transfer.highest_contiguous_ack
        );

        if transfer.is_complete() {
            info!(
                "Transfer {} to {} complete after {:?} ({} resends)",
                transfer_id,
                peer,
                transfer.elapsed(now),
                transfer.resends
            );
            self.transfers.remove(&key);
            self.metrics.completed += 1;
            return AckOutcome::Completed;
        }
        AckOutcome::Advanced {
            highest_contiguous_ack: transfer.highest_contiguous_ack,
        }
    }

    /// Select sent-but-unacked chunks older than the resend timeout.
    ///
    /// Only the window just past each cursor is inspected. Selected chunks
    /// get a fresh send timestamp, so the caller must actually resend them.
    /// Paused transfers are skipped.
    pub fn check_for_lost_chunks(&mut self, now: Instant) -> Vec<ResendItem> {
        let mut resend = Vec::new();
        for transfer in self.transfers.values_mut() {
            if transfer.paused {
                continue;
            }
            let first = (transfer.highest_contiguous_ack + 1) as usize;
            let last = (transfer.highest_contiguous_ack as i64 + self.resend_window as i64)
                .min(transfer.total_chunks() as i64 - 1);
            if last < first as i64 {
                continue;
            }
            for idx in first..=last as usize {
                if !transfer.sent[idx] || transfer.acked[idx] {
                    continue;
                }
                let stale = match transfer.sent_at[idx] {
                    Some(at) => now.saturating_duration_since(at) > self.resend_timeout,
                    None => true,
                };
                if stale {
                    transfer.sent_at[idx] = Some(now);
                    transfer.resends += 1;
                    resend.push(ResendItem {
                        peer: transfer.peer,
                        transfer_id: transfer.transfer_id.clone(),
                        sequence: idx as i32,
                    });
                }
            }
        }
        if !resend.is_empty() {
            debug!("Resending {} stale chunk(s)", resend.len());
            self.metrics.resends += resend.len() as u64;
        }
        resend
    }

    /// Envelope for a receiver-requested resend, if the chunk still matters.
    pub fn resend_request(
        &mut self,
        peer: PeerId,
        transfer_id: &str,
        seq: i32,
        now: Instant,
    ) -> Option<SecureTransfer> {
        if self.is_settled(peer, transfer_id, seq) {
            return None;
        }
        let envelope = self.build_chunk(peer, transfer_id, seq)?;
        if let Some(transfer) = self.transfers.get_mut(&(peer, transfer_id.to_string())) {
            let idx = seq as usize;
            transfer.sent[idx] = true;
            transfer.sent_at[idx] = Some(now);
            transfer.last_activity = now;
            transfer.resends += 1;
        }
        self.metrics.resends += 1;
        Some(envelope)
    }

    /// Drop transfers with no activity for the idle timeout.
    pub fn reap_idle(&mut self, now: Instant) -> Vec<(PeerId, String)> {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<_> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) > idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            warn!("Abandoning idle transfer {} to {}", key.1, key.0);
            self.transfers.remove(key);
        }
        self.metrics.reaped += stale.len() as u64;
        stale
    }

    /// Freeze every transfer to `peer` (its connection closed).
    pub fn pause_peer(&mut self, peer: PeerId) -> usize {
        let mut paused = 0;
        for transfer in self.transfers.values_mut().filter(|t| t.peer == peer) {
            transfer.paused = true;
            paused += 1;
        }
        if paused > 0 {
            info!("Paused {} transfer(s) to {}", paused, peer);
        }
        paused
    }

    /// Unfreeze transfers to `peer`. Returns never-sent chunks to reschedule.
    ///
    /// Sent-but-unacked chunks are left to [`Self::check_for_lost_chunks`].
    pub fn resume_peer(&mut self, peer: PeerId, now: Instant) -> Vec<(String, Vec<i32>)> {
        let mut pending = Vec::new();
        for transfer in self.transfers.values_mut().filter(|t| t.peer == peer) {
            if !transfer.paused {
                continue;
            }
            transfer.paused = false;
            transfer.last_activity = now;
            pending.push((transfer.transfer_id.clone(), transfer.unsent()));
        }
        if !pending.is_empty() {
            info!("Resumed {} transfer(s) to {}", pending.len(), peer);
        }
        pending
    }

    /// Drop every transfer to `peer`.
    pub fn cancel_peer(&mut self, peer: PeerId) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|(p, _), _| *p != peer);
        let cancelled = before - self.transfers.len();
        self.metrics.cancelled += cancelled as u64;
        cancelled
    }

    /// Drop everything (host shutdown).
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.transfers.len();
        self.transfers.clear();
        self.metrics.cancelled += cancelled as u64;
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: PeerId = PeerId(11);

    fn tracker() -> TransferTracker {
        TransferTracker::new(&TransferConfig {
            chunk_size: 512,
            ..TransferConfig::default()
        })
    }

    fn payload(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn send_all(tracker: &mut TransferTracker, id: &str, total: usize, now: Instant) {
        for seq in 0..total as i32 {
            tracker.mark_sent(PEER, id, seq, now);
        }
    }

    #[test]
    fn test_chunk_count_and_envelope() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert_eq!(tracker.start_transfer(PEER, "t", "world.sav", payload(1300), now), 3);

        let last = tracker.build_chunk(PEER, "t", 2).expect("chunk 2");
        assert_eq!(last.sequence, 2);
        let chunk = SnapshotChunk::reconstruct(&last.payload).expect("intact");
        assert_eq!(chunk.offset, 1024);
        assert_eq!(chunk.total_size, 1300);
        assert_eq!(chunk.data.len(), 276);
        assert!(tracker.build_chunk(PEER, "t", 3).is_none());
        assert!(tracker.build_chunk(PEER, "t", -1).is_none());
    }

    #[test]
    fn test_empty_payload_is_one_chunk() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert_eq!(tracker.start_transfer(PEER, "t", "empty.sav", payload(0), now), 1);
        let chunk = tracker.build_chunk(PEER, "t", 0).expect("chunk 0");
        let inner = SnapshotChunk::reconstruct(&chunk.payload).expect("intact");
        assert!(inner.data.is_empty());
        assert_eq!(tracker.handle_ack(PEER, "t", 0, now), AckOutcome::Completed);
    }

    #[test]
    fn test_out_of_order_acks_advance_cursor() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(512 * 4), now);
        send_all(&mut tracker, "t", 4, now);

        assert_eq!(
            tracker.handle_ack(PEER, "t", 1, now),
            AckOutcome::Advanced {
                highest_contiguous_ack: -1
            }
        );
        assert_eq!(
            tracker.handle_ack(PEER, "t", 0, now),
            AckOutcome::Advanced {
                highest_contiguous_ack: 1
            }
        );
        assert_eq!(tracker.handle_ack(PEER, "t", 0, now), AckOutcome::Duplicate);
        assert_eq!(tracker.handle_ack(PEER, "t", 9, now), AckOutcome::OutOfRange);
        assert_eq!(
            tracker.handle_ack(PEER, "t", 3, now),
            AckOutcome::Advanced {
                highest_contiguous_ack: 1
            }
        );
        assert_eq!(tracker.handle_ack(PEER, "t", 2, now), AckOutcome::Completed);
        assert!(tracker.is_empty());
        assert_eq!(tracker.handle_ack(PEER, "t", 2, now), AckOutcome::Unknown);
        assert_eq!(tracker.metrics().completed, 1);
    }

    #[test]
    fn test_sent_is_not_delivered() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(1024), now);
        send_all(&mut tracker, "t", 2, now);
        let transfer = tracker.get(PEER, "t").expect("active");
        assert!(transfer.is_sent(0) && transfer.is_sent(1));
        assert!(!transfer.is_complete());
    }

    #[test]
    fn test_sweep_resends_only_stale_window() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(512 * 30), start);
        send_all(&mut tracker, "t", 30, start);
        tracker.handle_ack(PEER, "t", 0, start);
        tracker.handle_ack(PEER, "t", 2, start);

        assert!(tracker
            .check_for_lost_chunks(start + Duration::from_secs(4))
            .is_empty());

        let later = start + Duration::from_secs(6);
        let resent: Vec<i32> = tracker
            .check_for_lost_chunks(later)
            .into_iter()
            .map(|item| item.sequence)
            .collect();
        // Cursor is 0; window covers 1..=10, and 2 is acked.
        assert_eq!(resent, vec![1, 3, 4, 5, 6, 7, 8, 9, 10]);

        // Fresh timestamps: nothing is due right after a resend.
        assert!(tracker
            .check_for_lost_chunks(later + Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn test_unsent_chunks_are_not_swept() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(512 * 3), start);
        tracker.mark_sent(PEER, "t", 0, start);
        let resent = tracker.check_for_lost_chunks(start + Duration::from_secs(10));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence, 0);
    }

    #[test]
    fn test_pause_resume_keeps_ack_state() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(512 * 10), start);
        send_all(&mut tracker, "t", 8, start);
        for seq in 0..5 {
            tracker.handle_ack(PEER, "t", seq, start);
        }

        assert_eq!(tracker.pause_peer(PEER), 1);
        assert!(tracker
            .check_for_lost_chunks(start + Duration::from_secs(30))
            .is_empty());

        let resumed_at = start + Duration::from_secs(31);
        let pending = tracker.resume_peer(PEER, resumed_at);
        assert_eq!(pending, vec![("t".to_string(), vec![8, 9])]);

        let resent: Vec<i32> = tracker
            .check_for_lost_chunks(resumed_at)
            .into_iter()
            .map(|item| item.sequence)
            .collect();
        assert_eq!(resent, vec![5, 6, 7]);
    }

    #[test]
    fn test_resend_request_skips_acked() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.start_transfer(PEER, "t", "w", payload(1024), now);
        send_all(&mut tracker, "t", 2, now);
        tracker.handle_ack(PEER, "t", 0, now);

        assert!(tracker.resend_request(PEER, "t", 0, now).is_none());
        let chunk = tracker.resend_request(PEER, "t", 1, now).expect("unacked");
        assert_eq!(chunk.sequence, 1);
        assert!(tracker.resend_request(PEER, "other", 1, now).is_none());
    }

    #[test]
    fn test_idle_transfers_reaped() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.start_transfer(PEER, "a", "w", payload(10), start);
        tracker.start_transfer(PeerId(12), "b", "w", payload(10), start);
        tracker.mark_sent(PeerId(12), "b", 0, start + Duration::from_secs(100));

        let reaped = tracker.reap_idle(start + Duration::from_secs(121));
        assert_eq!(reaped, vec![(PEER, "a".to_string())]);
        assert!(tracker.is_active(PeerId(12), "b"));
    }

    #[test]
    fn test_cancellation() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.start_transfer(PEER, "a", "w", payload(10), now);
        tracker.start_transfer(PEER, "b", "w", payload(10), now);
        tracker.start_transfer(PeerId(12), "c", "w", payload(10), now);

        assert_eq!(tracker.cancel_peer(PEER), 2);
        assert_eq!(tracker.cancel_all(), 1);
        assert!(tracker.is_empty());
        assert_eq!(tracker.metrics().cancelled, 3);
    }
}
