//! Applying replicated world state to the local replica.

use colonysync_core::{
    building_net_id, ExistingRegistration, IdentityRegistry, MarkerCategory, MarkerKey, NetId,
    ReplicaWorld,
};
use colonysync_net::{reconcile, CellUpdate, Packet};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Outcome of one world-update batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Cells written.
    pub applied: usize,
    /// Records dropped before reaching the world.
    pub skipped: usize,
    /// Records the world refused.
    pub failed: usize,
}

impl ApplyReport {
    /// Add another batch's counts.
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Write every usable record of a batch into `world`.
///
/// Records outside the grid and records with impossible mass are skipped.
/// A refused record is logged and does not stop the rest of the batch.
pub fn apply_world_update<W: ReplicaWorld + ?Sized>(
    world: &mut W,
    updates: &[CellUpdate],
) -> ApplyReport {
    let grid = world.grid();
    let mut report = ApplyReport::default();

    for update in updates {
        if !grid.is_valid_cell(update.cell) {
            report.skipped += 1;
            continue;
        }
        let Some(clean) = update.sanitized() else {
            debug!("Skipping cell {} with mass {}", update.cell, update.mass);
            report.skipped += 1;
            continue;
        };
        match world.apply_cell(clean.cell, clean.state()) {
            Ok(()) => report.applied += 1,
            Err(e) => {
                warn!("Failed to apply cell {}: {}", clean.cell, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Layer replicated buildings occupy.
pub const BUILDING_LAYER: i32 = 0;

/// Deterministic id of the building behind `key`.
pub fn building_id(key: MarkerKey) -> NetId {
    building_net_id(key.cell, BUILDING_LAYER)
}

fn register_building(ids: &mut IdentityRegistry<MarkerKey>, key: MarkerKey) {
    let id = building_id(key);
    if ids.register_existing(key, id) == ExistingRegistration::Claimed {
        warn!("Building id {} at cell {} already taken", id, key.cell);
    }
}

fn unregister_building(ids: &mut IdentityRegistry<MarkerKey>, key: MarkerKey) {
    let id = building_id(key);
    if ids.try_get(id) == Some(key) {
        ids.unregister(id);
    }
}

/// Rebuild `ids` from the buildings present in `world`, e.g. after a load.
pub fn index_buildings<W: ReplicaWorld + ?Sized>(
    world: &W,
    ids: &mut IdentityRegistry<MarkerKey>,
) -> usize {
    ids.clear();
    for key in world.markers(MarkerCategory::Building) {
        register_building(ids, key);
    }
    ids.len()
}

/// Markers removed and spawned by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerReport {
    /// Local phantoms destroyed.
    pub removed: usize,
    /// Missing markers instantiated.
    pub spawned: usize,
    /// Operations the world refused.
    pub failed: usize,
}

impl MarkerReport {
    /// Add another reconciliation's counts.
    pub fn merge(&mut self, other: MarkerReport) {
        self.removed += other.removed;
        self.spawned += other.spawned;
        self.failed += other.failed;
    }
}

/// Make the local `category` set equal to `remote`.
///
/// Phantoms are removed before missing markers are spawned so a cell whose
/// marker changed kind ends up with only the new one. Buildings are
/// unregistered from `ids` when removed and registered when spawned.
pub fn reconcile_markers<W: ReplicaWorld + ?Sized>(
    world: &mut W,
    category: MarkerCategory,
    remote: &BTreeSet<MarkerKey>,
    ids: &mut IdentityRegistry<MarkerKey>,
) -> MarkerReport {
    let buildings = category == MarkerCategory::Building;
    let local = world.markers(category);
    let diff = reconcile(&local, remote);
    let mut report = MarkerReport::default();

    for key in diff.to_remove {
        match world.remove_marker(category, key) {
            Ok(()) => {
                if buildings {
                    unregister_building(ids, key);
                }
                report.removed += 1;
            }
            Err(e) => {
                warn!("Failed to remove {} marker at {}: {}", category.as_str(), key.cell, e);
                report.failed += 1;
            }
        }
    }
    for key in diff.to_add {
        match world.spawn_marker(category, key) {
            Ok(()) => {
                if buildings {
                    register_building(ids, key);
                }
                report.spawned += 1;
            }
            Err(e) => {
                warn!("Failed to spawn {} marker at {}: {}", category.as_str(), key.cell, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// The category and full remote set carried by a marker packet.
///
/// Dig markers travel as bare cells and come back with kind 0.
pub fn marker_set(packet: &Packet) -> Option<(MarkerCategory, BTreeSet<MarkerKey>)> {
    match packet {
        Packet::DiggingState(state) => Some((
            MarkerCategory::Dig,
            state.cells.iter().map(|cell| MarkerKey::new(*cell, 0)).collect(),
        )),
        Packet::ChoreState(state) => {
            Some((MarkerCategory::Mop, state.chores.iter().copied().collect()))
        }
        Packet::BuildingState(state) => Some((
            MarkerCategory::Building,
            state.buildings.iter().copied().collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colonysync_core::{CellState, GridSize};
    use colonysync_net::protocol::{BuildingState, DiggingState, Ping};
    use colonysync_testkit::GridWorld;

    fn water(mass: f32) -> CellState {
        CellState {
            element: 7,
            temperature: 300.0,
            mass,
            disease: 0,
            disease_count: 0,
        }
    }

    #[test]
    fn test_valid_cells_applied_and_bad_ones_skipped() {
        let mut world = GridWorld::new(GridSize::new(4, 4));
        let updates = vec![
            CellUpdate::new(3, water(50.0)),
            CellUpdate::new(99, water(50.0)),
            CellUpdate::new(-1, water(50.0)),
            CellUpdate::new(5, water(f32::NAN)),
        ];

        let report = apply_world_update(&mut world, &updates);
        assert_eq!(
            report,
            ApplyReport {
                applied: 1,
                skipped: 3,
                failed: 0
            }
        );
        assert_eq!(world.cell(3).element, 7);
        assert_eq!(world.cell(5).element, 1);
    }

    #[test]
    fn test_cold_cell_gets_fallback_temperature() {
        let mut world = GridWorld::new(GridSize::new(4, 4));
        let mut frozen = water(10.0);
        frozen.temperature = 0.5;

        apply_world_update(&mut world, &[CellUpdate::new(2, frozen)]);
        assert_eq!(world.cell(2).temperature, colonysync_net::cells::FALLBACK_TEMPERATURE);
    }

    #[test]
    fn test_reconcile_removes_phantoms_and_spawns_missing() {
        let mut world = GridWorld::new(GridSize::new(8, 8));
        world.add_marker(MarkerCategory::Mop, MarkerKey::new(1, 0));
        world.add_marker(MarkerCategory::Mop, MarkerKey::new(2, 0));
        let remote = BTreeSet::from([MarkerKey::new(2, 0), MarkerKey::new(9, 1)]);

        let mut ids = IdentityRegistry::with_seed(1);
        let report = reconcile_markers(&mut world, MarkerCategory::Mop, &remote, &mut ids);
        assert_eq!(report.removed, 1);
        assert_eq!(report.spawned, 1);
        assert_eq!(world.markers_of(MarkerCategory::Mop), remote);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_rebuilt_building_keeps_its_id() {
        let mut world = GridWorld::new(GridSize::new(8, 8));
        let mut ids = IdentityRegistry::with_seed(2);
        let ladder = MarkerKey::new(12, 77);

        let built = BTreeSet::from([ladder]);
        reconcile_markers(&mut world, MarkerCategory::Building, &built, &mut ids);
        let id = ids.id_of(ladder).expect("registered on spawn");
        assert_eq!(id, building_net_id(12, BUILDING_LAYER));

        reconcile_markers(&mut world, MarkerCategory::Building, &BTreeSet::new(), &mut ids);
        assert_eq!(ids.try_get(id), None);

        reconcile_markers(&mut world, MarkerCategory::Building, &built, &mut ids);
        assert_eq!(ids.id_of(ladder), Some(id));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_replaced_building_takes_over_cell_id() {
        let mut world = GridWorld::new(GridSize::new(8, 8));
        world.add_building(5, "Ladder");
        let mut ids = IdentityRegistry::with_seed(3);
        assert_eq!(index_buildings(&world, &mut ids), 1);

        let door = MarkerKey::new(5, 99);
        let remote = BTreeSet::from([door]);
        let report = reconcile_markers(&mut world, MarkerCategory::Building, &remote, &mut ids);
        assert_eq!((report.removed, report.spawned), (1, 1));
        assert_eq!(ids.try_get(building_id(door)), Some(door));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_marker_set_from_packets() {
        let dig = Packet::DiggingState(DiggingState { cells: vec![4, 6] });
        let (category, set) = marker_set(&dig).unwrap();
        assert_eq!(category, MarkerCategory::Dig);
        assert_eq!(set, BTreeSet::from([MarkerKey::new(4, 0), MarkerKey::new(6, 0)]));

        let empty = Packet::BuildingState(BuildingState { buildings: vec![] });
        let (category, set) = marker_set(&empty).unwrap();
        assert_eq!(category, MarkerCategory::Building);
        assert!(set.is_empty());

        assert!(marker_set(&Packet::Ping(Ping { timestamp_micros: 1 })).is_none());
    }
}
