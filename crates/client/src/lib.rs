#![warn(missing_docs)]
//! Client side of the synchronization engine.
//!
//! [`ClientSession`] connects to one host, answers its compatibility
//! manifest, downloads the world snapshot through [`SnapshotDownload`] and
//! then applies live cell deltas and marker sets to a [`ReplicaWorld`].
//!
//! [`ReplicaWorld`]: colonysync_core::ReplicaWorld

pub mod apply;
pub mod download;
pub mod session;

pub use apply::{
    apply_world_update, building_id, index_buildings, marker_set, reconcile_markers, ApplyReport,
    MarkerReport, BUILDING_LAYER,
};
pub use download::{ChunkOutcome, DownloadMetrics, SnapshotDownload};
pub use session::{ClientSession, ClientState, ClientTickReport, ReadyView};
