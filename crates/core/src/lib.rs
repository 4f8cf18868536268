#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod config;
pub mod grid;
pub mod identity;
pub mod world;

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export commonly used types
pub use config::SyncConfig;
pub use grid::{CellIndex, CellRect, GridSize};
pub use identity::{building_net_id, ExistingRegistration, IdentityRegistry, NET_ID_FLOOR};
pub use world::{
    AuthoritativeWorld, CellState, MarkerCategory, MarkerKey, ReplicaWorld, SnapshotError,
    SnapshotSource, WorldError, WorldSnapshot,
};

/// Fixed tick counter driven by the host frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any session.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Stable identity of a remote peer, as resolved by the transport.
///
/// The default value is [`PeerId::UNKNOWN`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Placeholder used before the transport reports a local identity.
    pub const UNKNOWN: Self = Self(0);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Network identity of a replicated entity.
///
/// Non-zero by construction; randomly drawn ids are always at or above
/// [`NET_ID_FLOOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(pub i32);

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_tick_advances() {
        assert_eq!(SimTick::ZERO.advance(3), SimTick(3));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(PeerId(7).to_string(), "peer:7");
        assert_eq!(NetId(100_001).to_string(), "net:100001");
    }
}
