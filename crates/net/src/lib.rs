#![warn(missing_docs)]
//! Wire protocol, dispatch and bulk-transfer machinery shared by host and
//! client.

pub mod cells;
pub mod codec;
pub mod compat;
pub mod dispatch;
pub mod pacing;
pub mod protocol;
pub mod reassembly;
pub mod reconcile;
pub mod registry;
pub mod stats;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use cells::CellUpdate;
pub use codec::{compute_protocol_hash, encode_packet, plugin_type_hash, prefab_hash};
pub use compat::{check_compatibility, CompatibilityVerdict, EnvironmentManifest, ModEntry};
pub use dispatch::{
    Destination, DispatchOutcome, DispatchStats, Dispatcher, Envelope, Outbox, PacketHandler,
    PluginContext, WorldAccess,
};
pub use pacing::{PacedQueue, PendingSend};
pub use protocol::{Packet, PacketType, ReadyState, WireMessage};
pub use reassembly::{AssemblyError, AssemblyStatus, ChunkAssembler};
pub use reconcile::{reconcile, Reconciliation};
pub use registry::{PacketRegistry, PluginFactory, PluginPacket, PluginPayload, RegistryError};
pub use stats::BandwidthStats;
pub use transfer::{AckOutcome, OutgoingTransfer, ResendItem, TransferMetrics, TransferTracker};
pub use transport::{
    ConnectionHandle, InboundMessage, SendMode, Transport, TransportError, TransportEvent,
};
pub use wire::{WireError, WireReader, WireWriter};
