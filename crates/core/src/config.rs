//! Tunables for the synchronization engine.
//!
//! Every section is `#[serde(default)]` so a partial TOML file only overrides
//! what it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest accepted bulk-transfer chunk.
pub const MIN_CHUNK_SIZE: usize = 512;

/// Largest accepted bulk-transfer chunk (transport message ceiling).
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Host-side bulk transfer.
    pub transfer: TransferConfig,
    /// Client-side snapshot download.
    pub download: DownloadConfig,
    /// World delta synchronization.
    pub world: WorldSyncConfig,
    /// Session polling and keepalive.
    pub session: SessionConfig,
    /// Environment compatibility policy.
    pub compatibility: CompatibilityConfig,
}

/// Bulk transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk before clamping.
    pub chunk_size: usize,
    /// Chunks released per pacing step.
    pub chunks_per_tick: usize,
    /// Delay between pacing steps.
    pub send_interval_ms: u64,
    /// Age after which an unacked chunk is resent.
    pub resend_timeout_ms: u64,
    /// How far past the contiguous-ack cursor the sweep looks.
    pub resend_window: usize,
    /// Idle time after which a transfer is abandoned.
    pub idle_timeout_secs: u64,
    /// Retry delay after the transport refuses a send.
    pub retry_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            chunks_per_tick: 2,
            send_interval_ms: 50,
            resend_timeout_ms: 5_000,
            resend_window: 10,
            idle_timeout_secs: 120,
            retry_backoff_ms: 50,
        }
    }
}

impl TransferConfig {
    /// Chunk size clamped to the transport-safe range.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    /// Pacing step delay.
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Unacked chunk age before resend.
    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    /// Inactivity before a transfer is reaped.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Backoff after a refused send.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Snapshot download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Silence after which stall checks begin.
    pub inactivity_secs: u64,
    /// Minimum spacing between stall checks.
    pub stall_check_interval_secs: u64,
    /// Stalls tolerated before a full resend is requested.
    pub max_stall_checks: u32,
    /// Progress reporting granularity.
    pub progress_step_percent: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            inactivity_secs: 10,
            stall_check_interval_secs: 30,
            max_stall_checks: 3,
            progress_step_percent: 5,
        }
    }
}

impl DownloadConfig {
    /// Silence before stall checks.
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    /// Spacing of stall checks.
    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs)
    }
}

/// World delta synchronizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSyncConfig {
    /// Cell diff cadence.
    pub cell_sync_interval_ms: u64,
    /// Cell diff cadence while the host frame rate is low.
    pub slow_cell_sync_interval_ms: u64,
    /// Frame rate below which the slow cadence applies.
    pub low_fps_threshold: f32,
    /// Staggered marker cycle step.
    pub marker_sync_interval_ms: u64,
    /// Quiet period after the host starts.
    pub startup_grace_secs: u64,
    /// Cells added around every viewport.
    pub viewport_margin: i32,
    /// Mass change that counts as a delta.
    pub mass_epsilon: f32,
    /// Records per world-update packet.
    pub max_updates_per_packet: usize,
    /// zstd level for cell batches.
    pub compression_level: i32,
}

impl Default for WorldSyncConfig {
    fn default() -> Self {
        Self {
            cell_sync_interval_ms: 1_500,
            slow_cell_sync_interval_ms: 3_000,
            low_fps_threshold: 30.0,
            marker_sync_interval_ms: 1_000,
            startup_grace_secs: 5,
            viewport_margin: 2,
            mass_epsilon: 0.01,
            max_updates_per_packet: 180,
            compression_level: 3,
        }
    }
}

impl WorldSyncConfig {
    /// Cell cadence for the given host frame rate.
    pub fn cell_interval(&self, fps: Option<f32>) -> Duration {
        match fps {
            Some(fps) if fps < self.low_fps_threshold => {
                Duration::from_millis(self.slow_cell_sync_interval_ms)
            }
            _ => Duration::from_millis(self.cell_sync_interval_ms),
        }
    }

    /// Marker cycle step.
    pub fn marker_interval(&self) -> Duration {
        Duration::from_millis(self.marker_sync_interval_ms)
    }

    /// Startup quiet period.
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inbound messages drained per poll.
    pub max_messages_per_poll: usize,
    /// Client ping cadence.
    pub ping_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages_per_poll: 128,
            ping_interval_ms: 2_000,
        }
    }
}

impl SessionConfig {
    /// Client ping cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Compatibility handshake policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityConfig {
    /// Run the handshake at all. When off every peer is treated as compatible.
    pub enabled: bool,
    /// Accept peers whose mod versions differ.
    pub allow_version_mismatches: bool,
    /// Accept peers with mods the host lacks.
    pub allow_extra_mods: bool,
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_version_mismatches: false,
            allow_extra_mods: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_clamped() {
        let mut cfg = TransferConfig::default();
        assert_eq!(cfg.effective_chunk_size(), 64 * 1024);
        cfg.chunk_size = 1;
        assert_eq!(cfg.effective_chunk_size(), MIN_CHUNK_SIZE);
        cfg.chunk_size = usize::MAX;
        assert_eq!(cfg.effective_chunk_size(), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_low_fps_stretches_cell_cadence() {
        let cfg = WorldSyncConfig::default();
        assert_eq!(cfg.cell_interval(None), Duration::from_millis(1_500));
        assert_eq!(cfg.cell_interval(Some(60.0)), Duration::from_millis(1_500));
        assert_eq!(cfg.cell_interval(Some(20.0)), Duration::from_millis(3_000));
    }
}
