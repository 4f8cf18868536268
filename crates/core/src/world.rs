//! Seams to the simulation engine.
//!
//! The host reads authoritative state through [`AuthoritativeWorld`] and
//! captures bulk snapshots through [`SnapshotSource`]; clients apply replicated
//! state through [`ReplicaWorld`].

use crate::{CellIndex, GridSize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Replicated physical state of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CellState {
    /// Element table index.
    pub element: u16,
    /// Temperature in kelvin.
    pub temperature: f32,
    /// Mass in kilograms.
    pub mass: f32,
    /// Disease table index (`u8::MAX` for none).
    pub disease: u8,
    /// Germ count.
    pub disease_count: i32,
}

/// Kind of discrete marker reconciled by full-set comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MarkerCategory {
    /// Pending dig orders.
    Dig = 0,
    /// Pending mop chores.
    Mop = 1,
    /// Placed buildings.
    Building = 2,
}

impl MarkerCategory {
    /// Every category, in sync rotation order.
    pub const ALL: [Self; 3] = [Self::Dig, Self::Mop, Self::Building];

    /// Canonical string key used in configs/logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dig => "dig",
            Self::Mop => "mop",
            Self::Building => "building",
        }
    }
}

/// Identity of a marker that is comparable across host and client.
///
/// `kind` is zero for digs, the chore kind for chores, and the prefab hash of
/// the type name for buildings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerKey {
    /// Cell the marker occupies.
    pub cell: CellIndex,
    /// Category-specific kind discriminator.
    pub kind: i32,
}

impl MarkerKey {
    /// Create a key.
    pub const fn new(cell: CellIndex, kind: i32) -> Self {
        Self { cell, kind }
    }
}

/// A captured world snapshot ready for bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSnapshot {
    /// Human-readable name, used as the transfer file name.
    pub name: String,
    /// Serialized world.
    pub bytes: Vec<u8>,
}

/// Failure to capture a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The simulation is not in a state that can be saved.
    #[error("world is not ready for a snapshot: {0}")]
    NotReady(String),
    /// Serialization failed.
    #[error("failed to serialize world: {0}")]
    Serialize(String),
}

/// Failure applying replicated state to the local world.
#[derive(Debug, Error, PartialEq)]
pub enum WorldError {
    /// The cell index is outside the grid.
    #[error("cell {0} is outside the grid")]
    InvalidCell(CellIndex),
    /// The engine refused the mutation.
    #[error("mutation rejected: {0}")]
    Rejected(String),
    /// The received snapshot could not be loaded.
    #[error("failed to load snapshot: {0}")]
    Load(String),
}

/// Read access to the host's authoritative simulation.
pub trait AuthoritativeWorld {
    /// Grid dimensions.
    fn grid(&self) -> GridSize;

    /// Current state of a cell. Only called with valid cells.
    fn cell_state(&self, cell: CellIndex) -> CellState;

    /// Complete current set of markers of `category`.
    fn markers(&self, category: MarkerCategory) -> BTreeSet<MarkerKey>;
}

/// Produces the bulk world snapshot sent to joining peers.
pub trait SnapshotSource {
    /// Capture the current world.
    fn capture(&mut self) -> Result<WorldSnapshot, SnapshotError>;
}

/// Mutation access to a client's replica of the world.
pub trait ReplicaWorld {
    /// Grid dimensions.
    fn grid(&self) -> GridSize;

    /// Overwrite one cell with replicated state.
    fn apply_cell(&mut self, cell: CellIndex, state: CellState) -> Result<(), WorldError>;

    /// Locally present markers of `category`.
    fn markers(&self, category: MarkerCategory) -> BTreeSet<MarkerKey>;

    /// Destroy a local marker without notifying the host.
    fn remove_marker(&mut self, category: MarkerCategory, key: MarkerKey)
        -> Result<(), WorldError>;

    /// Instantiate a marker without notifying the host.
    fn spawn_marker(&mut self, category: MarkerCategory, key: MarkerKey)
        -> Result<(), WorldError>;

    /// Replace the local world with a received snapshot.
    fn load_snapshot(&mut self, snapshot: WorldSnapshot) -> Result<(), WorldError>;
}
