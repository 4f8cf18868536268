//! Host-side per-peer records.
//!
//! A record is created the first time a peer is seen and lives as long as the
//! session. A disconnect only clears the transport handle, so a returning peer
//! that passed the handshake keeps its verdict and skips it. A peer that was
//! rejected loses its verdict on reattach and is asked again.

use colonysync_core::PeerId;
use colonysync_net::{ConnectionHandle, ReadyState};
use std::collections::BTreeMap;

/// Everything the host knows about one peer.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    peer: PeerId,
    conn: Option<ConnectionHandle>,
    ready: ReadyState,
    compatibility_checked: bool,
    compatible: bool,
    compatibility_reason: String,
    sync_percent: i32,
    connect_count: u32,
}

impl ConnectionRecord {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            conn: None,
            ready: ReadyState::Unready,
            compatibility_checked: false,
            compatible: false,
            compatibility_reason: String::new(),
            sync_percent: 0,
            connect_count: 0,
        }
    }

    /// Remote identity.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Transport handle while connected.
    pub fn conn(&self) -> Option<ConnectionHandle> {
        self.conn
    }

    /// True while a transport connection is open.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Last reported readiness.
    pub fn ready(&self) -> ReadyState {
        self.ready
    }

    /// Set readiness.
    pub fn set_ready(&mut self, ready: ReadyState) {
        self.ready = ready;
    }

    /// Whether the compatibility handshake finished.
    pub fn compatibility_checked(&self) -> bool {
        self.compatibility_checked
    }

    /// Whether the handshake found the peer compatible.
    pub fn compatible(&self) -> bool {
        self.compatible
    }

    /// Reason the peer gave with its verdict.
    pub fn compatibility_reason(&self) -> &str {
        &self.compatibility_reason
    }

    /// Record the peer's verdict.
    pub fn set_compatibility(&mut self, compatible: bool, reason: impl Into<String>) {
        self.compatibility_checked = true;
        self.compatible = compatible;
        self.compatibility_reason = reason.into();
    }

    /// True once the peer may receive the world.
    pub fn can_receive_world(&self) -> bool {
        self.is_connected() && self.compatibility_checked && self.compatible
    }

    /// Last download progress report.
    pub fn sync_percent(&self) -> i32 {
        self.sync_percent
    }

    /// Store a download progress report.
    pub fn set_sync_percent(&mut self, percent: i32) {
        self.sync_percent = percent.clamp(0, 100);
    }

    /// How many times the peer has connected.
    pub fn connect_count(&self) -> u32 {
        self.connect_count
    }
}

/// Records for every peer seen this session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    records: BTreeMap<PeerId, ConnectionRecord>,
}

impl ConnectionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh transport handle, creating the record on first sight.
    pub fn attach(&mut self, peer: PeerId, conn: ConnectionHandle) -> &mut ConnectionRecord {
        let record = self
            .records
            .entry(peer)
            .or_insert_with(|| ConnectionRecord::new(peer));
        record.conn = Some(conn);
        record.connect_count += 1;
        if record.compatibility_checked && !record.compatible {
            record.compatibility_checked = false;
            record.compatibility_reason.clear();
        }
        record
    }

    /// Clear the handle of whichever record holds `conn`.
    pub fn detach(&mut self, conn: ConnectionHandle) -> Option<PeerId> {
        let record = self
            .records
            .values_mut()
            .find(|record| record.conn == Some(conn))?;
        record.conn = None;
        record.ready = ReadyState::Unready;
        Some(record.peer)
    }

    /// Look up a record.
    pub fn get(&self, peer: PeerId) -> Option<&ConnectionRecord> {
        self.records.get(&peer)
    }

    /// Look up a record mutably.
    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&peer)
    }

    /// Open handle for `peer`.
    pub fn conn_of(&self, peer: PeerId) -> Option<ConnectionHandle> {
        self.records.get(&peer).and_then(|record| record.conn)
    }

    /// Every record, connected or not.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    /// Every record mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionRecord> {
        self.records.values_mut()
    }

    /// Records with an open connection.
    pub fn connected(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values().filter(|record| record.is_connected())
    }

    /// Number of open connections.
    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    /// Records ever seen.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True before the first peer.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when every connected peer finished its handshake.
    pub fn all_checked(&self) -> bool {
        self.connected().all(|record| record.compatibility_checked)
    }

    /// Handles of peers that may receive world traffic, minus `skip`.
    pub fn world_targets(&self, skip: Option<PeerId>) -> Vec<(PeerId, ConnectionHandle)> {
        self.records
            .values()
            .filter(|record| record.can_receive_world() && Some(record.peer) != skip)
            .filter_map(|record| record.conn.map(|conn| (record.peer, conn)))
            .collect()
    }
}
