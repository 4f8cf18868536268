//! Network identity registry.
//!
//! Maps [`NetId`]s to local entity handles so replicated entities can be
//! addressed without engine-internal pointers. One registry is owned per
//! session role; there is no process-global table.

use crate::{CellIndex, NetId};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, warn};

/// Smallest id handed out by [`IdentityRegistry::register`].
///
/// Ids below the floor are left for hand-assigned identities.
pub const NET_ID_FLOOR: i32 = 100_000;

/// Base of the deterministic building id range.
const BUILDING_ID_BASE: i32 = 1_000_000_000;

/// Stride between building layers in the deterministic id range.
const BUILDING_LAYER_STRIDE: i32 = 1_000_000;

/// Deterministic id for a building, identical on host and client.
///
/// `1_000_000_000 + cell + layer * 1_000_000`, wrapping on overflow.
pub fn building_net_id(cell: CellIndex, layer: i32) -> NetId {
    NetId(
        BUILDING_ID_BASE
            .wrapping_add(cell)
            .wrapping_add(layer.wrapping_mul(BUILDING_LAYER_STRIDE)),
    )
}

/// Outcome of [`IdentityRegistry::register_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingRegistration {
    /// The mapping was installed.
    Inserted,
    /// The same mapping already existed.
    AlreadyPresent,
    /// The id belongs to another entity; nothing changed.
    Claimed,
}

/// Bidirectional `NetId <-> handle` table.
///
/// Invariant: every handle appears under at most one id and every id maps to
/// at most one handle.
pub struct IdentityRegistry<H> {
    by_id: HashMap<NetId, H>,
    by_handle: HashMap<H, NetId>,
    rng: StdRng,
    floor: i32,
}

impl<H> IdentityRegistry<H>
where
    H: Copy + Eq + Hash + std::fmt::Debug,
{
    /// Create an empty registry with an entropy-seeded id generator.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Create an empty registry with a reproducible id sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            by_id: HashMap::new(),
            by_handle: HashMap::new(),
            rng,
            floor: NET_ID_FLOOR,
        }
    }

    /// Lowest id this registry draws.
    pub fn floor(&self) -> i32 {
        self.floor
    }

    /// Register `entity` under a freshly drawn id.
    ///
    /// An entity that is already registered keeps its current id.
    pub fn register(&mut self, entity: H) -> NetId {
        if let Some(existing) = self.by_handle.get(&entity) {
            return *existing;
        }

        let id = loop {
            let candidate = NetId(self.rng.gen_range(self.floor..i32::MAX));
            if !self.by_id.contains_key(&candidate) {
                break candidate;
            }
        };

        self.by_id.insert(id, entity);
        self.by_handle.insert(entity, id);
        debug!(%id, ?entity, "Registered entity");
        id
    }

    /// Re-establish a known id, e.g. one restored from a save.
    ///
    /// Replaying the same mapping is a no-op. An id owned by a different
    /// entity is left untouched. If `entity` was registered under another id
    /// that mapping is dropped first.
    pub fn register_existing(&mut self, entity: H, id: NetId) -> ExistingRegistration {
        match self.by_id.get(&id) {
            Some(current) if *current == entity => return ExistingRegistration::AlreadyPresent,
            Some(current) => {
                debug!(%id, ?entity, owner = ?current, "Id already claimed, skipping");
                return ExistingRegistration::Claimed;
            }
            None => {}
        }

        if let Some(old) = self.by_handle.remove(&entity) {
            self.by_id.remove(&old);
        }
        self.by_id.insert(id, entity);
        self.by_handle.insert(entity, id);
        ExistingRegistration::Inserted
    }

    /// Force `entity` onto `id`.
    ///
    /// The entity's previous mapping is removed before the new one is
    /// installed. If `id` was claimed by another entity, that entity loses
    /// its registration.
    pub fn override_id(&mut self, entity: H, id: NetId) {
        if let Some(old) = self.by_handle.remove(&entity) {
            self.by_id.remove(&old);
        }

        if let Some(previous) = self.by_id.insert(id, entity) {
            if previous != entity {
                warn!(%id, ?previous, ?entity, "Overriding id claimed by another entity");
                self.by_handle.remove(&previous);
            }
        }
        self.by_handle.insert(entity, id);
    }

    /// Remove the mapping for `id`, returning the entity it pointed at.
    pub fn unregister(&mut self, id: NetId) -> Option<H> {
        let entity = self.by_id.remove(&id)?;
        self.by_handle.remove(&entity);
        Some(entity)
    }

    /// Look up the entity registered under `id`.
    pub fn try_get(&self, id: NetId) -> Option<H> {
        self.by_id.get(&id).copied()
    }

    /// Look up the id of `entity`.
    pub fn id_of(&self, entity: H) -> Option<NetId> {
        self.by_handle.get(&entity).copied()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop every mapping.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_handle.clear();
    }
}

impl<H> Default for IdentityRegistry<H>
where
    H: Copy + Eq + Hash + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
