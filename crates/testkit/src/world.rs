//! In-memory grid world that can play either side of the sync.

use anyhow::{Context, Result};
use colonysync_core::{
    AuthoritativeWorld, CellIndex, CellState, GridSize, MarkerCategory, MarkerKey, ReplicaWorld,
    SnapshotError, SnapshotSource, WorldError, WorldSnapshot,
};
use colonysync_net::prefab_hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Element every cell starts with.
pub const DEFAULT_ELEMENT: u16 = 1;

/// Mass every cell starts with.
pub const DEFAULT_MASS: f32 = 1000.0;

/// Name used for captured snapshots.
pub const SNAPSHOT_NAME: &str = "colony.sav";

fn default_cell() -> CellState {
    CellState {
        element: DEFAULT_ELEMENT,
        temperature: 293.15,
        mass: DEFAULT_MASS,
        disease: 0,
        disease_count: 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WorldState {
    grid: GridSize,
    cells: Vec<CellState>,
    markers: BTreeMap<MarkerCategory, BTreeSet<MarkerKey>>,
    /// Padding that inflates the snapshot to a chosen size.
    ballast: String,
}

/// Grid of cells plus marker sets, serialized to JSON for snapshots.
#[derive(Debug, Clone)]
pub struct GridWorld {
    state: WorldState,
    fail_capture: bool,
    captures: usize,
    loads: usize,
}

impl GridWorld {
    /// World of default cells and no markers.
    pub fn new(grid: GridSize) -> Self {
        let count = grid.cell_count();
        Self {
            state: WorldState {
                grid,
                cells: vec![default_cell(); count],
                markers: BTreeMap::new(),
                ballast: String::new(),
            },
            fail_capture: false,
            captures: 0,
            loads: 0,
        }
    }

    /// Grid dimensions.
    pub fn grid(&self) -> GridSize {
        self.state.grid
    }

    /// State of `cell`; the default cell outside the grid.
    pub fn cell(&self, cell: CellIndex) -> CellState {
        self.index(cell)
            .map_or_else(default_cell, |i| self.state.cells[i])
    }

    fn index(&self, cell: CellIndex) -> Option<usize> {
        if self.state.grid.is_valid_cell(cell) {
            usize::try_from(cell).ok()
        } else {
            None
        }
    }

    /// Overwrite `cell`. Out-of-grid cells are ignored.
    pub fn set_cell(&mut self, cell: CellIndex, state: CellState) {
        if let Some(i) = self.index(cell) {
            self.state.cells[i] = state;
        }
    }

    /// Change the mass of `cell`.
    pub fn set_mass(&mut self, cell: CellIndex, mass: f32) {
        if let Some(i) = self.index(cell) {
            self.state.cells[i].mass = mass;
        }
    }

    /// Change the element of `cell`.
    pub fn set_element(&mut self, cell: CellIndex, element: u16) {
        if let Some(i) = self.index(cell) {
            self.state.cells[i].element = element;
        }
    }

    /// Place a marker.
    pub fn add_marker(&mut self, category: MarkerCategory, key: MarkerKey) -> bool {
        self.state.markers.entry(category).or_default().insert(key)
    }

    /// Take a marker away.
    pub fn clear_marker(&mut self, category: MarkerCategory, key: MarkerKey) -> bool {
        self.state
            .markers
            .get_mut(&category)
            .is_some_and(|set| set.remove(&key))
    }

    /// Place a building, keyed by cell and prefab hash of `type_name`.
    pub fn add_building(&mut self, cell: CellIndex, type_name: &str) -> MarkerKey {
        let key = MarkerKey::new(cell, prefab_hash(type_name));
        self.add_marker(MarkerCategory::Building, key);
        key
    }

    /// Markers of `category`.
    pub fn markers_of(&self, category: MarkerCategory) -> BTreeSet<MarkerKey> {
        self.state
            .markers
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    /// Pad snapshots with `bytes` extra bytes.
    pub fn set_ballast(&mut self, bytes: usize) {
        self.state.ballast = "#".repeat(bytes);
    }

    /// Make [`SnapshotSource::capture`] fail until turned off again.
    pub fn set_fail_capture(&mut self, fail: bool) {
        self.fail_capture = fail;
    }

    /// Successful captures so far.
    pub fn captures(&self) -> usize {
        self.captures
    }

    /// Snapshots loaded so far.
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Serialized world, as a snapshot would carry it.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.state).context("Failed to serialize grid world")
    }

    /// True when both worlds hold the same cells and markers.
    pub fn same_contents(&self, other: &GridWorld) -> bool {
        self.state.grid == other.state.grid
            && self.state.cells == other.state.cells
            && self.state.markers == other.state.markers
    }
}

impl AuthoritativeWorld for GridWorld {
    fn grid(&self) -> GridSize {
        self.state.grid
    }

    fn cell_state(&self, cell: CellIndex) -> CellState {
        self.cell(cell)
    }

    fn markers(&self, category: MarkerCategory) -> BTreeSet<MarkerKey> {
        self.markers_of(category)
    }
}

impl SnapshotSource for GridWorld {
    fn capture(&mut self) -> Result<WorldSnapshot, SnapshotError> {
        if self.fail_capture {
            return Err(SnapshotError::NotReady("capture disabled".to_string()));
        }
        let bytes = serde_json::to_vec(&self.state)
            .map_err(|e| SnapshotError::Serialize(e.to_string()))?;
        self.captures += 1;
        Ok(WorldSnapshot {
            name: SNAPSHOT_NAME.to_string(),
            bytes,
        })
    }
}

impl ReplicaWorld for GridWorld {
    fn grid(&self) -> GridSize {
        self.state.grid
    }

    fn apply_cell(&mut self, cell: CellIndex, state: CellState) -> Result<(), WorldError> {
        let i = self.index(cell).ok_or(WorldError::InvalidCell(cell))?;
        self.state.cells[i] = state;
        Ok(())
    }

    fn markers(&self, category: MarkerCategory) -> BTreeSet<MarkerKey> {
        self.markers_of(category)
    }

    fn remove_marker(
        &mut self,
        category: MarkerCategory,
        key: MarkerKey,
    ) -> Result<(), WorldError> {
        if self.clear_marker(category, key) {
            Ok(())
        } else {
            Err(WorldError::Rejected(format!(
                "no {} marker at {}",
                category.as_str(),
                key.cell
            )))
        }
    }

    fn spawn_marker(&mut self, category: MarkerCategory, key: MarkerKey) -> Result<(), WorldError> {
        if !self.state.grid.is_valid_cell(key.cell) {
            return Err(WorldError::InvalidCell(key.cell));
        }
        self.add_marker(category, key);
        Ok(())
    }

    fn load_snapshot(&mut self, snapshot: WorldSnapshot) -> Result<(), WorldError> {
        let state: WorldState = serde_json::from_slice(&snapshot.bytes)
            .map_err(|e| WorldError::Load(format!("{}: {}", snapshot.name, e)))?;
        if state.cells.len() != state.grid.cell_count() {
            return Err(WorldError::Load(format!(
                "{} holds {} cells for a {}x{} grid",
                snapshot.name,
                state.cells.len(),
                state.grid.width,
                state.grid.height
            )));
        }
        debug!("Loaded {} ({} cells)", snapshot.name, state.cells.len());
        self.state = state;
        self.loads += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_load_copy_contents() {
        let mut host = GridWorld::new(GridSize::new(6, 6));
        host.set_element(4, 12);
        host.add_building(7, "Ladder");
        host.set_ballast(100);
        let snapshot = host.capture().expect("capture");
        assert!(snapshot.bytes.len() > 100);

        let mut replica = GridWorld::new(GridSize::new(2, 2));
        replica.load_snapshot(snapshot).expect("load");
        assert!(replica.same_contents(&host));
        assert_eq!(replica.loads(), 1);
    }

    #[test]
    fn test_capture_failure_toggle() {
        let mut world = GridWorld::new(GridSize::new(2, 2));
        world.set_fail_capture(true);
        assert!(world.capture().is_err());
        world.set_fail_capture(false);
        assert!(world.capture().is_ok());
        assert_eq!(world.captures(), 1);
    }

    #[test]
    fn test_replica_rejects_bad_input() {
        let mut world = GridWorld::new(GridSize::new(2, 2));
        assert_eq!(
            world.apply_cell(9, CellState::default()),
            Err(WorldError::InvalidCell(9))
        );
        assert!(world
            .remove_marker(MarkerCategory::Dig, MarkerKey::new(1, 0))
            .is_err());
        let garbage = WorldSnapshot {
            name: "junk".to_string(),
            bytes: b"not json".to_vec(),
        };
        assert!(matches!(
            world.load_snapshot(garbage),
            Err(WorldError::Load(_))
        ));
    }

    #[test]
    fn test_buildings_keyed_by_prefab_hash() {
        let mut world = GridWorld::new(GridSize::new(4, 4));
        let key = world.add_building(3, "Ladder");
        assert_eq!(key.kind, prefab_hash("Ladder"));
        assert!(world.markers_of(MarkerCategory::Building).contains(&key));
    }
}
