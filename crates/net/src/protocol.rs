//! Packet catalogue.
//!
//! Every packet on the wire is `[tag: u8][fields]`. Field layouts are
//! hand-written against [`WireWriter`]/[`WireReader`] so they stay byte-exact
//! across builds.

use crate::cells::{self, CellUpdate};
use crate::compat::{EnvironmentManifest, ModEntry};
use crate::registry::PluginPacket;
use crate::transport::SendMode;
use crate::wire::{WireError, WireReader, WireWriter};
use colonysync_core::{CellRect, MarkerKey, PeerId};

/// Field-level serialization shared by every packet payload.
///
/// `read_fields` populates an empty (default) instance, mirroring how the
/// registry constructs inbound packets before decoding them.
pub trait WireMessage {
    /// Append this payload's fields.
    fn write_fields(&self, w: &mut WireWriter);

    /// Populate fields from `r`.
    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError>;
}

/// Stable one-byte packet tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketType {
    /// Host environment manifest.
    CompatibilityManifest = 1,
    /// Peer verdict on the manifest.
    CompatibilityReply = 2,
    /// Request for the world snapshot.
    SnapshotRequest = 3,
    /// Integrity-checked bulk chunk envelope.
    SecureTransfer = 4,
    /// Bulk chunk acknowledgment.
    ChunkAck = 5,
    /// Targeted retransmission request.
    ChunkResendRequest = 6,
    /// Download progress report.
    SyncProgress = 7,
    /// Peer ready flag.
    ReadyStatus = 8,
    /// Ready count broadcast.
    ReadyStatusUpdate = 9,
    /// Everyone is ready.
    AllClientsReady = 10,
    /// Batched cell deltas.
    WorldUpdate = 11,
    /// Cursor and viewport of a peer.
    PlayerCursor = 12,
    /// Dig marker set.
    DiggingState = 13,
    /// Chore marker set.
    ChoreState = 14,
    /// Building set.
    BuildingState = 15,
    /// Latency probe.
    Ping = 16,
    /// Latency probe echo.
    Pong = 17,
    /// Full resync announcement.
    HardSync = 18,
    /// Orderly disconnect.
    Disconnect = 19,
    /// Externally registered payload.
    Plugin = 200,
}

impl PacketType {
    /// Every built-in kind, in tag order.
    pub const CORE: [PacketType; 19] = [
        Self::CompatibilityManifest,
        Self::CompatibilityReply,
        Self::SnapshotRequest,
        Self::SecureTransfer,
        Self::ChunkAck,
        Self::ChunkResendRequest,
        Self::SyncProgress,
        Self::ReadyStatus,
        Self::ReadyStatusUpdate,
        Self::AllClientsReady,
        Self::WorldUpdate,
        Self::PlayerCursor,
        Self::DiggingState,
        Self::ChoreState,
        Self::BuildingState,
        Self::Ping,
        Self::Pong,
        Self::HardSync,
        Self::Disconnect,
    ];

    /// Raw tag byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Self::CompatibilityManifest,
            2 => Self::CompatibilityReply,
            3 => Self::SnapshotRequest,
            4 => Self::SecureTransfer,
            5 => Self::ChunkAck,
            6 => Self::ChunkResendRequest,
            7 => Self::SyncProgress,
            8 => Self::ReadyStatus,
            9 => Self::ReadyStatusUpdate,
            10 => Self::AllClientsReady,
            11 => Self::WorldUpdate,
            12 => Self::PlayerCursor,
            13 => Self::DiggingState,
            14 => Self::ChoreState,
            15 => Self::BuildingState,
            16 => Self::Ping,
            17 => Self::Pong,
            18 => Self::HardSync,
            19 => Self::Disconnect,
            200 => Self::Plugin,
            _ => return Err(WireError::UnknownTag(value)),
        })
    }
}

/// Peer readiness as tracked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReadyState {
    /// Still loading or syncing.
    #[default]
    Unready = 0,
    /// In game and caught up.
    Ready = 1,
}

impl TryFrom<u8> for ReadyState {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Unready),
            1 => Ok(Self::Ready),
            other => Err(WireError::InvalidEnum {
                what: "ready state",
                value: i64::from(other),
            }),
        }
    }
}

/// Chore kinds replicated through [`ChoreState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChoreKind {
    /// Mop a puddle.
    Mop = 0,
}

impl TryFrom<i32> for ChoreKind {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Mop),
            other => Err(WireError::InvalidEnum {
                what: "chore kind",
                value: i64::from(other),
            }),
        }
    }
}

/// Host environment manifest sent to every new peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompatibilityManifest {
    /// Host environment.
    pub manifest: EnvironmentManifest,
    /// Hash of `manifest`, carried so peers can log a short fingerprint.
    pub manifest_hash: u64,
}

impl CompatibilityManifest {
    /// Wrap a manifest with its hash.
    pub fn new(manifest: EnvironmentManifest) -> Self {
        let manifest_hash = manifest.hash();
        Self {
            manifest,
            manifest_hash,
        }
    }
}

impl WireMessage for CompatibilityManifest {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_string(&self.manifest.game_version);
        w.write_i32(self.manifest.mods.len() as i32);
        for entry in &self.manifest.mods {
            w.write_string(&entry.id);
            w.write_string(&entry.version);
        }
        w.write_u64(self.manifest_hash);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.manifest.game_version = r.read_string()?;
        let count = r.read_len_i32()?;
        let mut mods = Vec::with_capacity(r.capacity_hint(count, 2));
        for _ in 0..count {
            mods.push(ModEntry {
                id: r.read_string()?,
                version: r.read_string()?,
            });
        }
        self.manifest.mods = mods;
        self.manifest_hash = r.read_u64()?;
        Ok(())
    }
}

/// Peer verdict on the host manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompatibilityReply {
    /// Whether the peer can join.
    pub compatible: bool,
    /// Summary for the user-facing layer.
    pub reason: String,
    /// Host mods the peer lacks.
    pub missing: Vec<String>,
    /// Mods present with a different version.
    pub mismatched: Vec<String>,
    /// Peer mods the host lacks.
    pub extra: Vec<String>,
}

impl WireMessage for CompatibilityReply {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_bool(self.compatible);
        w.write_string(&self.reason);
        w.write_string_list(&self.missing);
        w.write_string_list(&self.mismatched);
        w.write_string_list(&self.extra);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.compatible = r.read_bool()?;
        self.reason = r.read_string()?;
        self.missing = r.read_string_list()?;
        self.mismatched = r.read_string_list()?;
        self.extra = r.read_string_list()?;
        Ok(())
    }
}

/// Client request for the world snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotRequest {
    /// Requesting peer.
    pub requester: PeerId,
}

impl WireMessage for SnapshotRequest {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u64(self.requester.0);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.requester = PeerId(r.read_u64()?);
        Ok(())
    }
}

/// Integrity-checked bulk chunk envelope.
///
/// Layout: `sequence:i32, transfer_id:string, payload_len:i32, payload`. The
/// payload is an encoded [`SnapshotChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecureTransfer {
    /// Chunk index within the transfer.
    pub sequence: i32,
    /// Transfer session id.
    pub transfer_id: String,
    /// Encoded chunk sub-message.
    pub payload: Vec<u8>,
}

impl WireMessage for SecureTransfer {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.sequence);
        w.write_string(&self.transfer_id);
        w.write_byte_array(&self.payload);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.sequence = r.read_i32()?;
        self.transfer_id = r.read_string()?;
        self.payload = r.read_byte_array()?;
        Ok(())
    }
}

/// One slice of a bulk payload, embedded inside [`SecureTransfer`].
///
/// Layout: `file_name:string, offset:i32, total_size:i32, len:i32, bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotChunk {
    /// Name of the transferred file.
    pub file_name: String,
    /// Byte offset of `data` within the file.
    pub offset: i32,
    /// Full file size.
    pub total_size: i32,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl SnapshotChunk {
    /// Serialize to a standalone blob.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(self.file_name.len() + self.data.len() + 16);
        self.write_fields(&mut w);
        w.into_bytes()
    }

    /// Rebuild a chunk from its blob.
    ///
    /// Succeeds only if every field reads exactly and no bytes are left over,
    /// so success proves the blob arrived intact.
    pub fn reconstruct(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let mut chunk = Self::default();
        chunk.read_fields(&mut r)?;
        r.finish()?;
        Ok(chunk)
    }
}

impl WireMessage for SnapshotChunk {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_string(&self.file_name);
        w.write_i32(self.offset);
        w.write_i32(self.total_size);
        w.write_byte_array(&self.data);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.file_name = r.read_string()?;
        self.offset = r.read_i32()?;
        self.total_size = r.read_i32()?;
        self.data = r.read_byte_array()?;
        Ok(())
    }
}

/// Acknowledgment of one bulk chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkAck {
    /// Acknowledged chunk index.
    pub sequence: i32,
    /// Transfer session id.
    pub transfer_id: String,
    /// Acknowledging peer.
    pub sender: PeerId,
}

impl WireMessage for ChunkAck {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.sequence);
        w.write_string(&self.transfer_id);
        w.write_u64(self.sender.0);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.sequence = r.read_i32()?;
        self.transfer_id = r.read_string()?;
        self.sender = PeerId(r.read_u64()?);
        Ok(())
    }
}

/// Request to resend one chunk that failed its integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkResendRequest {
    /// Chunk index.
    pub sequence: i32,
    /// Transfer session id.
    pub transfer_id: String,
}

impl WireMessage for ChunkResendRequest {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.sequence);
        w.write_string(&self.transfer_id);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.sequence = r.read_i32()?;
        self.transfer_id = r.read_string()?;
        Ok(())
    }
}

/// Download progress reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Reporting peer.
    pub peer: PeerId,
    /// File being downloaded.
    pub file_name: String,
    /// Distinct chunks received.
    pub received_chunks: i32,
    /// Chunks in the file.
    pub total_chunks: i32,
    /// Completion percentage, 0..=100.
    pub percent: i32,
}

impl WireMessage for SyncProgress {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u64(self.peer.0);
        w.write_string(&self.file_name);
        w.write_i32(self.received_chunks);
        w.write_i32(self.total_chunks);
        w.write_i32(self.percent);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.peer = PeerId(r.read_u64()?);
        self.file_name = r.read_string()?;
        self.received_chunks = r.read_i32()?;
        self.total_chunks = r.read_i32()?;
        self.percent = r.read_i32()?;
        Ok(())
    }
}

/// Peer announces its readiness.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadyStatus {
    /// New state.
    pub state: ReadyState,
}

impl WireMessage for ReadyStatus {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u8(self.state as u8);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.state = ReadyState::try_from(r.read_u8()?)?;
        Ok(())
    }
}

/// Host broadcast of ready counts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadyStatusUpdate {
    /// Peers that are ready.
    pub ready: i32,
    /// Peers counted.
    pub total: i32,
}

impl WireMessage for ReadyStatusUpdate {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.ready);
        w.write_i32(self.total);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.ready = r.read_i32()?;
        self.total = r.read_i32()?;
        Ok(())
    }
}

/// Batched cell deltas, compressed on the wire.
#[derive(Debug, Clone, Default)]
pub struct WorldUpdate {
    /// Cell records in this batch.
    pub updates: Vec<CellUpdate>,
    /// zstd level used when writing; not transmitted.
    pub compression_level: i32,
}

impl WorldUpdate {
    /// Batch `updates`, compressing at `compression_level`.
    pub fn new(updates: Vec<CellUpdate>, compression_level: i32) -> Self {
        Self {
            updates,
            compression_level,
        }
    }
}

impl PartialEq for WorldUpdate {
    fn eq(&self, other: &Self) -> bool {
        self.updates == other.updates
    }
}

impl WireMessage for WorldUpdate {
    fn write_fields(&self, w: &mut WireWriter) {
        cells::write_compressed_batch(w, &self.updates, self.compression_level);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.updates = cells::read_compressed_batch(r)?;
        Ok(())
    }
}

/// Cursor position and viewport of one peer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerCursor {
    /// Owning peer.
    pub peer: PeerId,
    /// World-space cursor x.
    pub x: f32,
    /// World-space cursor y.
    pub y: f32,
    /// Visible cell rectangle.
    pub viewport: CellRect,
}

impl WireMessage for PlayerCursor {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u64(self.peer.0);
        w.write_f32(self.x);
        w.write_f32(self.y);
        w.write_i32(self.viewport.min_x);
        w.write_i32(self.viewport.min_y);
        w.write_i32(self.viewport.max_x);
        w.write_i32(self.viewport.max_y);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.peer = PeerId(r.read_u64()?);
        self.x = r.read_f32()?;
        self.y = r.read_f32()?;
        self.viewport = CellRect::new(r.read_i32()?, r.read_i32()?, r.read_i32()?, r.read_i32()?);
        Ok(())
    }
}

/// Complete set of dig markers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiggingState {
    /// Cells with a pending dig.
    pub cells: Vec<i32>,
}

impl WireMessage for DiggingState {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.cells.len() as i32);
        for cell in &self.cells {
            w.write_i32(*cell);
        }
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        let count = r.read_len_i32()?;
        let mut cells = Vec::with_capacity(r.capacity_hint(count, 4));
        for _ in 0..count {
            cells.push(r.read_i32()?);
        }
        self.cells = cells;
        Ok(())
    }
}

/// Complete set of chore markers, keyed by `(cell, chore kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChoreState {
    /// Markers; `kind` holds a [`ChoreKind`] discriminant.
    pub chores: Vec<MarkerKey>,
}

impl WireMessage for ChoreState {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.chores.len() as i32);
        for chore in &self.chores {
            w.write_i32(chore.cell);
            w.write_i32(chore.kind);
        }
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        let count = r.read_len_i32()?;
        let mut chores = Vec::with_capacity(r.capacity_hint(count, 8));
        for _ in 0..count {
            let cell = r.read_i32()?;
            let kind = ChoreKind::try_from(r.read_i32()?)?;
            chores.push(MarkerKey::new(cell, kind as i32));
        }
        self.chores = chores;
        Ok(())
    }
}

/// Complete set of buildings, keyed by `(cell, prefab hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildingState {
    /// Buildings; `kind` holds the prefab hash.
    pub buildings: Vec<MarkerKey>,
}

impl WireMessage for BuildingState {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i32(self.buildings.len() as i32);
        for building in &self.buildings {
            w.write_i32(building.cell);
            w.write_i32(building.kind);
        }
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        let count = r.read_len_i32()?;
        let mut buildings = Vec::with_capacity(r.capacity_hint(count, 8));
        for _ in 0..count {
            buildings.push(MarkerKey::new(r.read_i32()?, r.read_i32()?));
        }
        self.buildings = buildings;
        Ok(())
    }
}

/// Latency probe carrying the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ping {
    /// Sender clock in microseconds.
    pub timestamp_micros: i64,
}

impl WireMessage for Ping {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i64(self.timestamp_micros);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.timestamp_micros = r.read_i64()?;
        Ok(())
    }
}

/// Echo of a [`Ping`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pong {
    /// Timestamp copied from the ping.
    pub timestamp_micros: i64,
}

impl WireMessage for Pong {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_i64(self.timestamp_micros);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.timestamp_micros = r.read_i64()?;
        Ok(())
    }
}

/// Orderly disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    /// Human-readable reason.
    pub reason: String,
}

impl WireMessage for Disconnect {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_string(&self.reason);
    }

    fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        self.reason = r.read_string()?;
        Ok(())
    }
}

/// Every packet the engine understands.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// See [`CompatibilityManifest`].
    CompatibilityManifest(CompatibilityManifest),
    /// See [`CompatibilityReply`].
    CompatibilityReply(CompatibilityReply),
    /// See [`SnapshotRequest`].
    SnapshotRequest(SnapshotRequest),
    /// See [`SecureTransfer`].
    SecureTransfer(SecureTransfer),
    /// See [`ChunkAck`].
    ChunkAck(ChunkAck),
    /// See [`ChunkResendRequest`].
    ChunkResendRequest(ChunkResendRequest),
    /// See [`SyncProgress`].
    SyncProgress(SyncProgress),
    /// See [`ReadyStatus`].
    ReadyStatus(ReadyStatus),
    /// See [`ReadyStatusUpdate`].
    ReadyStatusUpdate(ReadyStatusUpdate),
    /// Every connected peer is ready.
    AllClientsReady,
    /// See [`WorldUpdate`].
    WorldUpdate(WorldUpdate),
    /// See [`PlayerCursor`].
    PlayerCursor(PlayerCursor),
    /// See [`DiggingState`].
    DiggingState(DiggingState),
    /// See [`ChoreState`].
    ChoreState(ChoreState),
    /// See [`BuildingState`].
    BuildingState(BuildingState),
    /// See [`Ping`].
    Ping(Ping),
    /// See [`Pong`].
    Pong(Pong),
    /// A fresh snapshot for every peer follows.
    HardSync,
    /// See [`Disconnect`].
    Disconnect(Disconnect),
    /// Externally registered payload.
    Plugin(PluginPacket),
}

impl Packet {
    /// Empty instance for a core tag, ready for [`Packet::read_fields`].
    ///
    /// Returns `None` for [`PacketType::Plugin`], which the registry builds
    /// from its plugin table instead.
    pub fn empty(packet_type: PacketType) -> Option<Self> {
        Some(match packet_type {
            PacketType::CompatibilityManifest => Self::CompatibilityManifest(Default::default()),
            PacketType::CompatibilityReply => Self::CompatibilityReply(Default::default()),
            PacketType::SnapshotRequest => Self::SnapshotRequest(Default::default()),
            PacketType::SecureTransfer => Self::SecureTransfer(Default::default()),
            PacketType::ChunkAck => Self::ChunkAck(Default::default()),
            PacketType::ChunkResendRequest => Self::ChunkResendRequest(Default::default()),
            PacketType::SyncProgress => Self::SyncProgress(Default::default()),
            PacketType::ReadyStatus => Self::ReadyStatus(Default::default()),
            PacketType::ReadyStatusUpdate => Self::ReadyStatusUpdate(Default::default()),
            PacketType::AllClientsReady => Self::AllClientsReady,
            PacketType::WorldUpdate => Self::WorldUpdate(Default::default()),
            PacketType::PlayerCursor => Self::PlayerCursor(Default::default()),
            PacketType::DiggingState => Self::DiggingState(Default::default()),
            PacketType::ChoreState => Self::ChoreState(Default::default()),
            PacketType::BuildingState => Self::BuildingState(Default::default()),
            PacketType::Ping => Self::Ping(Default::default()),
            PacketType::Pong => Self::Pong(Default::default()),
            PacketType::HardSync => Self::HardSync,
            PacketType::Disconnect => Self::Disconnect(Default::default()),
            PacketType::Plugin => return None,
        })
    }

    /// Wire tag of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::CompatibilityManifest(_) => PacketType::CompatibilityManifest,
            Self::CompatibilityReply(_) => PacketType::CompatibilityReply,
            Self::SnapshotRequest(_) => PacketType::SnapshotRequest,
            Self::SecureTransfer(_) => PacketType::SecureTransfer,
            Self::ChunkAck(_) => PacketType::ChunkAck,
            Self::ChunkResendRequest(_) => PacketType::ChunkResendRequest,
            Self::SyncProgress(_) => PacketType::SyncProgress,
            Self::ReadyStatus(_) => PacketType::ReadyStatus,
            Self::ReadyStatusUpdate(_) => PacketType::ReadyStatusUpdate,
            Self::AllClientsReady => PacketType::AllClientsReady,
            Self::WorldUpdate(_) => PacketType::WorldUpdate,
            Self::PlayerCursor(_) => PacketType::PlayerCursor,
            Self::DiggingState(_) => PacketType::DiggingState,
            Self::ChoreState(_) => PacketType::ChoreState,
            Self::BuildingState(_) => PacketType::BuildingState,
            Self::Ping(_) => PacketType::Ping,
            Self::Pong(_) => PacketType::Pong,
            Self::HardSync => PacketType::HardSync,
            Self::Disconnect(_) => PacketType::Disconnect,
            Self::Plugin(_) => PacketType::Plugin,
        }
    }

    /// Delivery mode used when the caller does not choose one.
    ///
    /// Last-value-wins state goes unreliable; everything else is reliable.
    pub fn default_send_mode(&self) -> SendMode {
        match self {
            Self::WorldUpdate(_)
            | Self::PlayerCursor(_)
            | Self::DiggingState(_)
            | Self::ChoreState(_)
            | Self::BuildingState(_) => SendMode::Unreliable,
            _ => SendMode::Reliable,
        }
    }

    /// Append this packet's fields (without the tag).
    pub fn write_fields(&self, w: &mut WireWriter) {
        match self {
            Self::CompatibilityManifest(p) => p.write_fields(w),
            Self::CompatibilityReply(p) => p.write_fields(w),
            Self::SnapshotRequest(p) => p.write_fields(w),
            Self::SecureTransfer(p) => p.write_fields(w),
            Self::ChunkAck(p) => p.write_fields(w),
            Self::ChunkResendRequest(p) => p.write_fields(w),
            Self::SyncProgress(p) => p.write_fields(w),
            Self::ReadyStatus(p) => p.write_fields(w),
            Self::ReadyStatusUpdate(p) => p.write_fields(w),
            Self::WorldUpdate(p) => p.write_fields(w),
            Self::PlayerCursor(p) => p.write_fields(w),
            Self::DiggingState(p) => p.write_fields(w),
            Self::ChoreState(p) => p.write_fields(w),
            Self::BuildingState(p) => p.write_fields(w),
            Self::Ping(p) => p.write_fields(w),
            Self::Pong(p) => p.write_fields(w),
            Self::Disconnect(p) => p.write_fields(w),
            Self::Plugin(p) => p.write_fields(w),
            Self::AllClientsReady | Self::HardSync => {}
        }
    }

    /// Populate this (empty) packet from `r`.
    pub fn read_fields(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        match self {
            Self::CompatibilityManifest(p) => p.read_fields(r),
            Self::CompatibilityReply(p) => p.read_fields(r),
            Self::SnapshotRequest(p) => p.read_fields(r),
            Self::SecureTransfer(p) => p.read_fields(r),
            Self::ChunkAck(p) => p.read_fields(r),
            Self::ChunkResendRequest(p) => p.read_fields(r),
            Self::SyncProgress(p) => p.read_fields(r),
            Self::ReadyStatus(p) => p.read_fields(r),
            Self::ReadyStatusUpdate(p) => p.read_fields(r),
            Self::WorldUpdate(p) => p.read_fields(r),
            Self::PlayerCursor(p) => p.read_fields(r),
            Self::DiggingState(p) => p.read_fields(r),
            Self::ChoreState(p) => p.read_fields(r),
            Self::BuildingState(p) => p.read_fields(r),
            Self::Ping(p) => p.read_fields(r),
            Self::Pong(p) => p.read_fields(r),
            Self::Disconnect(p) => p.read_fields(r),
            Self::Plugin(p) => p.read_payload_fields(r),
            Self::AllClientsReady | Self::HardSync => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_fields<M: WireMessage>(msg: &M) -> Vec<u8> {
        let mut w = WireWriter::new();
        msg.write_fields(&mut w);
        w.into_bytes()
    }

    #[test]
    fn test_packet_type_tags_are_stable() {
        assert_eq!(PacketType::SecureTransfer.as_u8(), 4);
        assert_eq!(PacketType::ChunkAck.as_u8(), 5);
        assert_eq!(PacketType::WorldUpdate.as_u8(), 11);
        assert_eq!(PacketType::try_from(19).expect("valid"), PacketType::Disconnect);
        assert_eq!(PacketType::try_from(0), Err(WireError::UnknownTag(0)));
        assert_eq!(PacketType::try_from(99), Err(WireError::UnknownTag(99)));
    }

    #[test]
    fn test_secure_transfer_layout() {
        let packet = SecureTransfer {
            sequence: 3,
            transfer_id: "ab".to_string(),
            payload: vec![9, 8],
        };
        let bytes = encode_fields(&packet);
        assert_eq!(bytes, vec![3, 0, 0, 0, 2, b'a', b'b', 2, 0, 0, 0, 9, 8]);
    }

    #[test]
    fn test_chunk_ack_layout() {
        let ack = ChunkAck {
            sequence: 1,
            transfer_id: "t".to_string(),
            sender: PeerId(2),
        };
        let bytes = encode_fields(&ack);
        assert_eq!(bytes, vec![1, 0, 0, 0, 1, b't', 2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_snapshot_chunk_reconstructs() {
        let chunk = SnapshotChunk {
            file_name: "colony.sav".to_string(),
            offset: 1024,
            total_size: 4096,
            data: vec![7; 32],
        };
        let blob = chunk.encode();
        let rebuilt = SnapshotChunk::reconstruct(&blob).expect("intact blob");
        assert_eq!(rebuilt, chunk);
    }

    #[test]
    fn test_snapshot_chunk_truncation_detected() {
        let chunk = SnapshotChunk {
            file_name: "colony.sav".to_string(),
            offset: 0,
            total_size: 8,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let blob = chunk.encode();
        for cut in 0..blob.len() {
            assert!(
                SnapshotChunk::reconstruct(&blob[..cut]).is_err(),
                "truncation to {cut} bytes was accepted"
            );
        }
    }

    #[test]
    fn test_snapshot_chunk_padding_detected() {
        let mut blob = SnapshotChunk::default().encode();
        blob.push(0);
        assert_eq!(
            SnapshotChunk::reconstruct(&blob),
            Err(WireError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_unknown_chore_kind_rejected() {
        let mut w = WireWriter::new();
        w.write_i32(1);
        w.write_i32(10);
        w.write_i32(7);
        let bytes = w.into_bytes();
        let mut packet = ChoreState::default();
        let result = packet.read_fields(&mut WireReader::new(&bytes));
        assert!(matches!(result, Err(WireError::InvalidEnum { .. })));
    }

    #[test]
    fn test_default_send_modes() {
        assert_eq!(
            Packet::WorldUpdate(WorldUpdate::default()).default_send_mode(),
            SendMode::Unreliable
        );
        assert_eq!(
            Packet::ChunkAck(ChunkAck::default()).default_send_mode(),
            SendMode::Reliable
        );
    }
}
