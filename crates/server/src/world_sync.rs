//! World delta synchronizer.
//!
//! Two cadences share one driver. The cell pass diffs authoritative cell
//! state inside the union of peer viewports against a shadow copy and
//! broadcasts the changes in unreliable batches. The marker pass rotates
//! through marker categories and broadcasts each complete set for the
//! clients to reconcile.

use colonysync_core::config::WorldSyncConfig;
use colonysync_core::{AuthoritativeWorld, CellRect, CellState, GridSize, MarkerCategory, PeerId};
use colonysync_net::cells::split_batches;
use colonysync_net::protocol::{BuildingState, ChoreState, DiggingState, WorldUpdate};
use colonysync_net::{CellUpdate, Outbox, Packet};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Counters for the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct WorldSyncMetrics {
    /// Cell passes run (seeding included).
    pub cell_passes: u64,
    /// Cell records emitted.
    pub cells_sent: u64,
    /// World-update packets emitted.
    pub update_packets: u64,
    /// Full marker sets emitted.
    pub marker_broadcasts: u64,
}

/// What one [`WorldSynchronizer::tick`] emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Cell records queued.
    pub cells: usize,
    /// World-update packets queued.
    pub update_packets: usize,
    /// Marker category broadcast this tick.
    pub markers: Option<MarkerCategory>,
}

/// Host-side delta producer.
#[derive(Debug)]
pub struct WorldSynchronizer {
    config: WorldSyncConfig,
    shadow: Vec<CellState>,
    shadow_grid: Option<GridSize>,
    viewports: BTreeMap<PeerId, CellRect>,
    host_viewport: Option<CellRect>,
    started_at: Option<Instant>,
    last_cell_pass: Option<Instant>,
    last_marker_pass: Option<Instant>,
    marker_cursor: usize,
    frame_rate: Option<f32>,
    metrics: WorldSyncMetrics,
}

impl WorldSynchronizer {
    /// Idle synchronizer; call [`Self::start`] when the host is up.
    pub fn new(config: WorldSyncConfig) -> Self {
        Self {
            config,
            shadow: Vec::new(),
            shadow_grid: None,
            viewports: BTreeMap::new(),
            host_viewport: None,
            started_at: None,
            last_cell_pass: None,
            last_marker_pass: None,
            marker_cursor: 0,
            frame_rate: None,
            metrics: WorldSyncMetrics::default(),
        }
    }

    /// Begin the startup grace period.
    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.last_cell_pass = None;
        self.last_marker_pass = None;
    }

    /// Stop emitting and drop the shadow. Viewports are kept.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.shadow.clear();
        self.shadow_grid = None;
        self.marker_cursor = 0;
    }

    /// Whether the shadow holds a seeded copy of the world.
    pub fn is_seeded(&self) -> bool {
        self.shadow_grid.is_some()
    }

    /// Counters so far.
    pub fn metrics(&self) -> &WorldSyncMetrics {
        &self.metrics
    }

    /// Record the viewport a peer reported.
    pub fn set_viewport(&mut self, peer: PeerId, viewport: CellRect) {
        self.viewports.insert(peer, viewport);
    }

    /// Forget a peer's viewport.
    pub fn remove_viewport(&mut self, peer: PeerId) -> Option<CellRect> {
        self.viewports.remove(&peer)
    }

    /// Include (or stop including) the host's own view.
    pub fn set_host_viewport(&mut self, viewport: Option<CellRect>) {
        self.host_viewport = viewport;
    }

    /// Host frame rate, used to pick the cell cadence.
    pub fn set_frame_rate(&mut self, fps: Option<f32>) {
        self.frame_rate = fps;
    }

    /// Registered peer viewports.
    pub fn viewport_count(&self) -> usize {
        self.viewports.len()
    }

    /// Cells inside any padded viewport, as a per-cell mask.
    pub fn interest_mask(&self, grid: GridSize) -> Vec<bool> {
        let mut mask = vec![false; grid.cell_count()];
        for rect in self.viewports.values().chain(self.host_viewport.iter()) {
            for cell in rect.padded(self.config.viewport_margin).cells(grid) {
                mask[cell as usize] = true;
            }
        }
        mask
    }

    fn seed<W: AuthoritativeWorld + ?Sized>(&mut self, world: &W, grid: GridSize) {
        self.shadow = (0..grid.cell_count() as i32)
            .map(|cell| world.cell_state(cell))
            .collect();
        self.shadow_grid = Some(grid);
        debug!(
            "Seeded shadow for {}x{} grid ({} cells)",
            grid.width,
            grid.height,
            self.shadow.len()
        );
    }

    /// Diff the world against the shadow inside the interest mask.
    ///
    /// The first pass, and the first pass after the grid changes size, only
    /// seeds the shadow and returns nothing.
    pub fn diff_cells<W: AuthoritativeWorld + ?Sized>(&mut self, world: &W) -> Vec<CellUpdate> {
        self.metrics.cell_passes += 1;
        let grid = world.grid();
        if self.shadow_grid != Some(grid) {
            self.seed(world, grid);
            return Vec::new();
        }

        let epsilon = self.config.mass_epsilon;
        let mask = self.interest_mask(grid);
        let mut updates = Vec::new();
        for (idx, interested) in mask.into_iter().enumerate() {
            if !interested {
                continue;
            }
            let cell = idx as i32;
            let current = world.cell_state(cell);
            let shadow = &mut self.shadow[idx];
            if current.element != shadow.element || (current.mass - shadow.mass).abs() > epsilon {
                *shadow = current;
                updates.push(CellUpdate::new(cell, current));
            }
        }
        self.metrics.cells_sent += updates.len() as u64;
        updates
    }

    /// Full-set packet for one marker category.
    pub fn marker_packet<W: AuthoritativeWorld + ?Sized>(
        world: &W,
        category: MarkerCategory,
    ) -> Packet {
        let keys = world.markers(category);
        match category {
            MarkerCategory::Dig => Packet::DiggingState(DiggingState {
                cells: keys.into_iter().map(|key| key.cell).collect(),
            }),
            MarkerCategory::Mop => Packet::ChoreState(ChoreState {
                chores: keys.into_iter().collect(),
            }),
            MarkerCategory::Building => Packet::BuildingState(BuildingState {
                buildings: keys.into_iter().collect(),
            }),
        }
    }

    fn due(last: Option<Instant>, interval: std::time::Duration, now: Instant) -> bool {
        match last {
            Some(at) => now.saturating_duration_since(at) >= interval,
            None => true,
        }
    }

    /// Run whichever passes are due and queue their packets.
    pub fn tick<W: AuthoritativeWorld + ?Sized>(
        &mut self,
        now: Instant,
        world: &W,
        outbox: &mut Outbox,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(started_at) = self.started_at else {
            return report;
        };
        if now.saturating_duration_since(started_at) < self.config.startup_grace() {
            return report;
        }

        let cell_interval = self.config.cell_interval(self.frame_rate);
        if Self::due(self.last_cell_pass, cell_interval, now) {
            self.last_cell_pass = Some(now);
            let updates = self.diff_cells(world);
            report.cells = updates.len();
            for batch in split_batches(&updates, self.config.max_updates_per_packet) {
                outbox.broadcast(Packet::WorldUpdate(WorldUpdate::new(
                    batch,
                    self.config.compression_level,
                )));
                report.update_packets += 1;
            }
            self.metrics.update_packets += report.update_packets as u64;
            if report.cells > 0 {
                trace!(
                    "Cell pass: {} update(s) in {} packet(s)",
                    report.cells,
                    report.update_packets
                );
            }
        }

        if Self::due(self.last_marker_pass, self.config.marker_interval(), now) {
            self.last_marker_pass = Some(now);
            let category = MarkerCategory::ALL[self.marker_cursor % MarkerCategory::ALL.len()];
            self.marker_cursor = (self.marker_cursor + 1) % MarkerCategory::ALL.len();
            outbox.broadcast(Self::marker_packet(world, category));
            self.metrics.marker_broadcasts += 1;
            report.markers = Some(category);
        }
        report
    }
}
