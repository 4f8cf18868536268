#![warn(missing_docs)]
//! Host side of the synchronization engine.
//!
//! [`HostSession`] owns the transport, the per-peer [`ConnectionTable`], the
//! [`BulkSender`] that delivers world snapshots, and the
//! [`WorldSynchronizer`] that streams cell deltas and marker sets.

pub mod bulk;
pub mod connection;
pub mod ready;
pub mod session;
pub mod world_sync;

pub use bulk::{BulkSender, PumpReport};
pub use connection::{ConnectionRecord, ConnectionTable};
pub use ready::{mark_all_unready, ReadySummary};
pub use session::{HostSession, HostState, HostTickReport};
pub use world_sync::{SyncReport, WorldSyncMetrics, WorldSynchronizer};
