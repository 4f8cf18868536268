//! Snapshot download: integrity check, acknowledgment, reassembly, progress
//! reporting and stall recovery.

use colonysync_core::config::DownloadConfig;
use colonysync_core::{PeerId, WorldSnapshot};
use colonysync_net::protocol::{
    ChunkAck, ChunkResendRequest, SecureTransfer, SnapshotChunk, SnapshotRequest, SyncProgress,
};
use colonysync_net::{AssemblyStatus, ChunkAssembler, Outbox, Packet};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Stalls count only once this many chunks arrived.
const MIN_CHUNKS_FOR_STALL: usize = 5;

/// Result of feeding one envelope to the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The envelope failed its integrity check or did not fit the file.
    Rejected,
    /// Stored; more chunks needed.
    Stored {
        /// Distinct chunks held.
        received_chunks: usize,
        /// Chunks expected.
        total_chunks: usize,
    },
    /// The last missing chunk arrived.
    Complete(WorldSnapshot),
}

/// Download counters.
#[derive(Debug, Clone, Default)]
pub struct DownloadMetrics {
    /// Envelopes that passed the integrity check.
    pub chunks_received: u64,
    /// Envelopes that failed it.
    pub integrity_failures: u64,
    /// Full snapshot re-requests after repeated stalls.
    pub full_resends: u64,
    /// Files assembled.
    pub completed: u64,
}

#[derive(Debug, Clone)]
struct ActiveFile {
    name: String,
    reported_step: Option<i32>,
}

/// Client-side state of the snapshot being received.
#[derive(Debug)]
pub struct SnapshotDownload {
    config: DownloadConfig,
    assembler: ChunkAssembler,
    active: Option<ActiveFile>,
    last_stall_check: Option<Instant>,
    stall_count: u32,
    /// Set on reconnect until the host sends the next chunk.
    resume_since: Option<Instant>,
    metrics: DownloadMetrics,
}

impl SnapshotDownload {
    /// Idle download.
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            config,
            assembler: ChunkAssembler::new(),
            active: None,
            last_stall_check: None,
            stall_count: 0,
            resume_since: None,
            metrics: DownloadMetrics::default(),
        }
    }

    /// True while a file is partially received.
    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    /// Name of the file being received.
    pub fn file_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    /// Distinct chunks held and chunks expected.
    pub fn chunk_counts(&self) -> Option<(usize, usize)> {
        let name = self.file_name()?;
        self.assembler.chunk_counts(name)
    }

    /// Stalls seen on the current file.
    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    /// Counters so far.
    pub fn metrics(&self) -> &DownloadMetrics {
        &self.metrics
    }

    /// True while waiting for the host to resume after a reconnect.
    pub fn awaiting_resume(&self) -> bool {
        self.resume_since.is_some()
    }

    /// Drop all partial state (hard sync or full resend).
    pub fn reset(&mut self) {
        self.assembler.clear();
        self.active = None;
        self.last_stall_check = None;
        self.stall_count = 0;
        self.resume_since = None;
    }

    /// The link came back with a file half received.
    ///
    /// The host may have abandoned the transfer while we were away. If no
    /// chunk arrives within `inactivity_secs`, [`Self::check_stall`] drops the
    /// partial file and asks for the whole snapshot again.
    pub fn await_resume(&mut self, now: Instant) {
        if self.in_progress() {
            self.resume_since = Some(now);
        }
    }

    fn progress_packet(
        local: PeerId,
        name: &str,
        received: usize,
        total: usize,
        percent: i32,
    ) -> Packet {
        Packet::SyncProgress(SyncProgress {
            peer: local,
            file_name: name.to_string(),
            received_chunks: received as i32,
            total_chunks: total as i32,
            percent,
        })
    }

    /// Verify, store and acknowledge one envelope from `host`.
    ///
    /// Only chunks the assembler keeps are acknowledged; anything else stays
    /// outstanding on the host and is resent by its lost-chunk sweep.
    pub fn on_envelope(
        &mut self,
        local: PeerId,
        host: PeerId,
        envelope: &SecureTransfer,
        outbox: &mut Outbox,
        now: Instant,
    ) -> ChunkOutcome {
        let chunk = match SnapshotChunk::reconstruct(&envelope.payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    "Chunk {} of {} failed integrity check: {}; requesting resend",
                    envelope.sequence, envelope.transfer_id, e
                );
                self.metrics.integrity_failures += 1;
                outbox.send_to(
                    host,
                    Packet::ChunkResendRequest(ChunkResendRequest {
                        sequence: envelope.sequence,
                        transfer_id: envelope.transfer_id.clone(),
                    }),
                );
                return ChunkOutcome::Rejected;
            }
        };

        self.metrics.chunks_received += 1;
        self.resume_since = None;
        trace!("Chunk {} of {} intact", envelope.sequence, envelope.transfer_id);

        if self.file_name() != Some(chunk.file_name.as_str()) {
            if let Some(previous) = self.active.take() {
                debug!("Switching download from {} to {}", previous.name, chunk.file_name);
                self.assembler.discard(&previous.name);
            }
            info!("Receiving {} ({} bytes)", chunk.file_name, chunk.total_size);
            self.active = Some(ActiveFile {
                name: chunk.file_name.clone(),
                reported_step: None,
            });
            self.stall_count = 0;
            self.last_stall_check = None;
        }

        let held_before = self
            .assembler
            .chunk_counts(&chunk.file_name)
            .map_or(0, |(received, _)| received);
        let status = match self.assembler.accept(&chunk, now) {
            Ok(status) => status,
            Err(e) => {
                warn!("Discarding chunk {}: {}", envelope.sequence, e);
                if self.assembler.chunk_counts(&chunk.file_name).is_none() {
                    self.active = None;
                }
                return ChunkOutcome::Rejected;
            }
        };
        outbox.send_to(
            host,
            Packet::ChunkAck(ChunkAck {
                sequence: envelope.sequence,
                transfer_id: envelope.transfer_id.clone(),
                sender: local,
            }),
        );

        match status {
            AssemblyStatus::Partial {
                received_chunks,
                total_chunks,
                received_bytes,
                total_size,
            } => {
                let percent = if total_size == 0 {
                    100
                } else {
                    (received_bytes * 100 / total_size) as i32
                };
                let step_size = self.config.progress_step_percent.max(1) as i32;
                let step = percent / step_size;
                if let Some(active) = self.active.as_mut() {
                    let first = active.reported_step.is_none();
                    if first || active.reported_step < Some(step) {
                        let shown = if first { 0 } else { step * step_size };
                        active.reported_step = Some(if first { 0 } else { step });
                        let progress = Self::progress_packet(
                            local,
                            &active.name,
                            received_chunks,
                            total_chunks,
                            shown,
                        );
                        outbox.send_to(host, progress);
                    }
                }
                ChunkOutcome::Stored {
                    received_chunks,
                    total_chunks,
                }
            }
            AssemblyStatus::Complete(bytes) => {
                let name = chunk.file_name;
                let total = held_before + 1;
                outbox.send_to(host, Self::progress_packet(local, &name, total, total, 100));
                info!("Download of {} complete ({} bytes)", name, bytes.len());
                self.metrics.completed += 1;
                self.active = None;
                self.stall_count = 0;
                self.last_stall_check = None;
                ChunkOutcome::Complete(WorldSnapshot { name, bytes })
            }
        }
    }

    /// Detect a stuck download. Returns true when a full resend was requested.
    ///
    /// A resume that never arrives within `inactivity_secs` of
    /// [`Self::await_resume`] restarts the download at once. Otherwise checks
    /// start after `inactivity_secs` without a chunk and run at most
    /// once per `stall_check_interval_secs`. Once more than
    /// `max_stall_checks` stalls were counted, the partial file is dropped
    /// and the snapshot requested again.
    pub fn check_stall(
        &mut self,
        local: PeerId,
        host: PeerId,
        outbox: &mut Outbox,
        now: Instant,
    ) -> bool {
        let Some(name) = self.file_name().map(str::to_string) else {
            return false;
        };
        if let Some(since) = self.resume_since {
            if now.saturating_duration_since(since) < self.config.inactivity() {
                return false;
            }
            warn!("Host never resumed {}; requesting a full resend", name);
            self.request_full_resend(local, host, outbox);
            return true;
        }
        let Some(last_chunk) = self.assembler.last_chunk_at(&name) else {
            return false;
        };
        if now.saturating_duration_since(last_chunk) < self.config.inactivity() {
            return false;
        }
        if let Some(at) = self.last_stall_check {
            if now.saturating_duration_since(at) < self.config.stall_check_interval() {
                return false;
            }
        }
        self.last_stall_check = Some(now);

        let Some((received, total)) = self.assembler.chunk_counts(&name) else {
            return false;
        };
        let missing = total.saturating_sub(received);
        if received > MIN_CHUNKS_FOR_STALL && missing > total / 2 {
            self.stall_count += 1;
            warn!(
                "Download of {} stalled ({}/{} chunks, stall {})",
                name, received, total, self.stall_count
            );
        }

        if self.stall_count > self.config.max_stall_checks {
            warn!("Giving up on {}; requesting a full resend", name);
            self.request_full_resend(local, host, outbox);
            return true;
        }
        false
    }

    fn request_full_resend(&mut self, local: PeerId, host: PeerId, outbox: &mut Outbox) {
        self.reset();
        self.metrics.full_resends += 1;
        outbox.send_to(
            host,
            Packet::SnapshotRequest(SnapshotRequest { requester: local }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LOCAL: PeerId = PeerId(2);
    const HOST: PeerId = PeerId(1);

    fn envelope(seq: usize, chunk_size: usize, file: &[u8]) -> SecureTransfer {
        let offset = seq * chunk_size;
        let end = (offset + chunk_size).min(file.len());
        let chunk = SnapshotChunk {
            file_name: "colony.sav".to_string(),
            offset: offset as i32,
            total_size: file.len() as i32,
            data: file[offset..end].to_vec(),
        };
        SecureTransfer {
            sequence: seq as i32,
            transfer_id: "t1".to_string(),
            payload: chunk.encode(),
        }
    }

    fn packets(outbox: &mut Outbox) -> Vec<Packet> {
        outbox.drain().into_iter().map(|e| e.packet).collect()
    }

    #[test]
    fn test_chunks_acked_and_assembled() {
        let file: Vec<u8> = (0..40u8).collect();
        let mut download = SnapshotDownload::new(DownloadConfig::default());
        let mut outbox = Outbox::new();
        let now = Instant::now();

        for seq in [3, 1, 0] {
            let chunk = envelope(seq, 10, &file);
            let outcome = download.on_envelope(LOCAL, HOST, &chunk, &mut outbox, now);
            assert!(matches!(outcome, ChunkOutcome::Stored { .. }));
        }
        let done = download.on_envelope(LOCAL, HOST, &envelope(2, 10, &file), &mut outbox, now);
        assert_eq!(
            done,
            ChunkOutcome::Complete(WorldSnapshot {
                name: "colony.sav".to_string(),
                bytes: file.clone()
            })
        );
        assert!(!download.in_progress());

        let acks: Vec<i32> = packets(&mut outbox)
            .into_iter()
            .filter_map(|p| match p {
                Packet::ChunkAck(ack) => Some(ack.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![3, 1, 0, 2]);
    }

    #[test]
    fn test_corrupt_envelope_requests_that_chunk() {
        let file = vec![7u8; 30];
        let mut download = SnapshotDownload::new(DownloadConfig::default());
        let mut outbox = Outbox::new();
        let mut bad = envelope(1, 10, &file);
        bad.payload.truncate(bad.payload.len() - 3);

        let outcome = download.on_envelope(LOCAL, HOST, &bad, &mut outbox, Instant::now());
        assert_eq!(outcome, ChunkOutcome::Rejected);
        assert_eq!(
            packets(&mut outbox),
            vec![Packet::ChunkResendRequest(ChunkResendRequest {
                sequence: 1,
                transfer_id: "t1".to_string()
            })]
        );
        assert_eq!(download.metrics().integrity_failures, 1);
    }

    #[test]
    fn test_progress_reported_in_steps() {
        let file = vec![1u8; 100];
        let mut download = SnapshotDownload::new(DownloadConfig {
            progress_step_percent: 25,
            ..DownloadConfig::default()
        });
        let mut outbox = Outbox::new();
        let now = Instant::now();

        for seq in 0..10 {
            download.on_envelope(LOCAL, HOST, &envelope(seq, 10, &file), &mut outbox, now);
        }
        let percents: Vec<i32> = packets(&mut outbox)
            .into_iter()
            .filter_map(|p| match p {
                Packet::SyncProgress(progress) => Some(progress.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 25, 50, 75, 100]);
    }

    #[test]
    fn test_repeated_stalls_trigger_full_resend() {
        let file = vec![0u8; 200];
        let config = DownloadConfig::default();
        let mut download = SnapshotDownload::new(config.clone());
        let mut outbox = Outbox::new();
        let start = Instant::now();

        for seq in 0..6 {
            download.on_envelope(LOCAL, HOST, &envelope(seq, 10, &file), &mut outbox, start);
        }
        outbox.drain();

        assert!(!download.check_stall(LOCAL, HOST, &mut outbox, start + Duration::from_secs(5)));
        let mut now = start + config.inactivity();
        for expected in 1..=config.max_stall_checks {
            assert!(!download.check_stall(LOCAL, HOST, &mut outbox, now));
            assert_eq!(download.stall_count(), expected);
            // Too soon for another check.
            let soon = now + Duration::from_secs(1);
            assert!(!download.check_stall(LOCAL, HOST, &mut outbox, soon));
            now += config.stall_check_interval();
        }
        assert!(download.check_stall(LOCAL, HOST, &mut outbox, now));
        assert!(!download.in_progress());
        assert_eq!(
            packets(&mut outbox),
            vec![Packet::SnapshotRequest(SnapshotRequest { requester: LOCAL })]
        );
    }

    #[test]
    fn test_few_chunks_never_count_as_stall() {
        let file = vec![0u8; 200];
        let mut download = SnapshotDownload::new(DownloadConfig::default());
        let mut outbox = Outbox::new();
        let start = Instant::now();
        download.on_envelope(LOCAL, HOST, &envelope(0, 10, &file), &mut outbox, start);

        for minute in 1..10u64 {
            let now = start + Duration::from_secs(60 * minute);
            download.check_stall(LOCAL, HOST, &mut outbox, now);
        }
        assert_eq!(download.stall_count(), 0);
        assert!(download.in_progress());
    }

    fn acks(outbox: &mut Outbox) -> Vec<i32> {
        packets(outbox)
            .into_iter()
            .filter_map(|p| match p {
                Packet::ChunkAck(ack) => Some(ack.sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_rejected_chunk_not_acked_until_resent_intact() {
        let file = vec![3u8; 30];
        let mut download = SnapshotDownload::new(DownloadConfig::default());
        let mut outbox = Outbox::new();
        let now = Instant::now();

        let mut overflowing = envelope(1, 10, &file);
        let chunk = SnapshotChunk {
            file_name: "colony.sav".to_string(),
            offset: 25,
            total_size: 30,
            data: vec![3u8; 10],
        };
        overflowing.payload = chunk.encode();
        let outcome = download.on_envelope(LOCAL, HOST, &overflowing, &mut outbox, now);
        assert_eq!(outcome, ChunkOutcome::Rejected);
        assert!(acks(&mut outbox).is_empty());

        let outcome = download.on_envelope(LOCAL, HOST, &envelope(1, 10, &file), &mut outbox, now);
        assert!(matches!(outcome, ChunkOutcome::Stored { received_chunks: 1, .. }));
        assert_eq!(acks(&mut outbox), vec![1]);
    }

    #[test]
    fn test_unanswered_resume_requests_full_snapshot() {
        let file = vec![0u8; 200];
        let config = DownloadConfig::default();
        let mut download = SnapshotDownload::new(config.clone());
        let mut outbox = Outbox::new();
        let start = Instant::now();
        for seq in 0..3 {
            download.on_envelope(LOCAL, HOST, &envelope(seq, 10, &file), &mut outbox, start);
        }
        outbox.drain();

        let back = start + Duration::from_secs(120);
        download.await_resume(back);
        assert!(download.awaiting_resume());
        let early = back + config.inactivity() - Duration::from_secs(1);
        assert!(!download.check_stall(LOCAL, HOST, &mut outbox, early));
        assert!(download.check_stall(LOCAL, HOST, &mut outbox, back + config.inactivity()));

        assert!(!download.in_progress());
        assert!(!download.awaiting_resume());
        assert_eq!(download.metrics().full_resends, 1);
        assert_eq!(
            packets(&mut outbox),
            vec![Packet::SnapshotRequest(SnapshotRequest { requester: LOCAL })]
        );
    }

    #[test]
    fn test_resumed_chunk_cancels_resume_wait() {
        let file = vec![0u8; 200];
        let config = DownloadConfig::default();
        let mut download = SnapshotDownload::new(config.clone());
        let mut outbox = Outbox::new();
        let start = Instant::now();
        download.on_envelope(LOCAL, HOST, &envelope(0, 10, &file), &mut outbox, start);

        download.await_resume(start);
        let later = start + Duration::from_secs(2);
        download.on_envelope(LOCAL, HOST, &envelope(1, 10, &file), &mut outbox, later);
        assert!(!download.awaiting_resume());
        let past = start + config.inactivity();
        assert!(!download.check_stall(LOCAL, HOST, &mut outbox, past));
        assert!(download.in_progress());
    }
}
