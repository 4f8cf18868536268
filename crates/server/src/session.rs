//! Host session: connection lifecycle, handshake, snapshot delivery and
//! world sync, all driven from [`HostSession::update`].

use crate::bulk::{BulkSender, PumpReport};
use crate::connection::ConnectionTable;
use crate::ready::{mark_all_unready, ReadySummary};
use crate::world_sync::{SyncReport, WorldSynchronizer};
use anyhow::{anyhow, bail, Context, Result};
use colonysync_core::{AuthoritativeWorld, PeerId, SnapshotSource, SyncConfig};
use colonysync_net::protocol::{CompatibilityManifest, Disconnect, Pong};
use colonysync_net::{
    BandwidthStats, ConnectionHandle, Destination, DispatchStats, Dispatcher, EnvironmentManifest,
    Outbox, Packet, PacketHandler, PacketRegistry, PluginPayload, Transport, TransportError,
    TransportEvent, WorldAccess,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Not hosting.
    Stopped,
    /// Building session state.
    Preparing,
    /// Opening the listen socket.
    Starting,
    /// Listening; no handshake outstanding.
    Started,
    /// At least one connected peer has not answered the manifest.
    WaitingForModSync,
    /// Every connected peer has answered the manifest.
    ModSyncComplete,
    /// Startup failed.
    Error,
}

impl HostState {
    /// Only these states drain the transport.
    pub fn processes_messages(&self) -> bool {
        matches!(
            self,
            HostState::Started | HostState::WaitingForModSync | HostState::ModSyncComplete
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HardSync {
    Idle,
    Requested,
    Running,
}

/// What one [`HostSession::update`] did.
#[derive(Debug, Clone, Default)]
pub struct HostTickReport {
    /// Transport lifecycle events handled.
    pub events: usize,
    /// Inbound messages dispatched.
    pub dispatched: usize,
    /// Snapshot transfers started.
    pub transfers_started: usize,
    /// Bulk sender activity.
    pub bulk: PumpReport,
    /// World sync activity.
    pub world: SyncReport,
    /// Packets handed to the transport.
    pub packets_sent: usize,
}

/// Session state the packet handlers mutate.
struct HostCore {
    config: SyncConfig,
    manifest: EnvironmentManifest,
    state: HostState,
    connections: ConnectionTable,
    bulk: BulkSender,
    world_sync: WorldSynchronizer,
    /// Peers waiting for a snapshot capture.
    snapshot_requests: BTreeSet<PeerId>,
    /// Requests that arrived before the peer's compatibility verdict.
    deferred_requests: BTreeSet<PeerId>,
    hard_sync: HardSync,
}

impl HostCore {
    fn announce_readiness(&mut self, outbox: &mut Outbox) {
        let summary = ReadySummary::of(&self.connections);
        debug!("Ready {}/{}", summary.ready, summary.total);
        if summary.all_ready() && self.hard_sync == HardSync::Running {
            info!("Hard sync finished; every peer is ready");
            self.hard_sync = HardSync::Idle;
        }
        outbox.broadcast(summary.to_packet());
    }

    fn refresh_mod_sync_state(&mut self) {
        if !matches!(
            self.state,
            HostState::Started | HostState::WaitingForModSync | HostState::ModSyncComplete
        ) {
            return;
        }
        let next = if self.connections.all_checked() {
            HostState::ModSyncComplete
        } else {
            HostState::WaitingForModSync
        };
        if next != self.state {
            info!("Host state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

impl PacketHandler for HostCore {
    fn handle_packet(
        &mut self,
        from: PeerId,
        packet: Packet,
        outbox: &mut Outbox,
        now: Instant,
    ) -> Result<()> {
        match packet {
            Packet::CompatibilityReply(reply) => {
                let record = self
                    .connections
                    .get_mut(from)
                    .ok_or_else(|| anyhow!("compatibility reply from unknown {}", from))?;
                record.set_compatibility(reply.compatible, reply.reason.clone());
                if reply.compatible {
                    info!("{} is compatible: {}", from, reply.reason);
                } else {
                    warn!(
                        "{} is incompatible: {} (missing {:?}, mismatched {:?}, extra {:?})",
                        from, reply.reason, reply.missing, reply.mismatched, reply.extra
                    );
                }
                if self.deferred_requests.remove(&from) && reply.compatible {
                    self.snapshot_requests.insert(from);
                }
                self.refresh_mod_sync_state();
            }
            Packet::SnapshotRequest(request) => {
                if request.requester != from {
                    trace!("Snapshot request names {} but came from {}", request.requester, from);
                }
                let record = self
                    .connections
                    .get(from)
                    .ok_or_else(|| anyhow!("snapshot request from unknown {}", from))?;
                if !record.compatibility_checked() {
                    debug!("Deferring snapshot request from {} until its verdict", from);
                    self.deferred_requests.insert(from);
                } else if record.compatible() {
                    self.snapshot_requests.insert(from);
                } else {
                    warn!("Ignoring snapshot request from incompatible {}", from);
                }
            }
            Packet::ChunkAck(ack) => {
                self.bulk.on_ack(from, &ack, now);
            }
            Packet::ChunkResendRequest(request) => {
                match self.bulk.on_resend_request(from, &request, now) {
                    Some(chunk) => {
                        debug!(
                            "Resending chunk {} of {} to {} on request",
                            request.sequence, request.transfer_id, from
                        );
                        outbox.send_to(from, Packet::SecureTransfer(chunk));
                    }
                    None => trace!(
                        "Resend request for settled chunk {} of {}",
                        request.sequence,
                        request.transfer_id
                    ),
                }
            }
            Packet::SyncProgress(progress) => {
                if let Some(record) = self.connections.get_mut(from) {
                    record.set_sync_percent(progress.percent);
                }
                debug!(
                    "{} downloaded {}/{} chunks of {} ({}%)",
                    from,
                    progress.received_chunks,
                    progress.total_chunks,
                    progress.file_name,
                    progress.percent
                );
            }
            Packet::ReadyStatus(status) => {
                let record = self
                    .connections
                    .get_mut(from)
                    .ok_or_else(|| anyhow!("ready status from unknown {}", from))?;
                record.set_ready(status.state);
                info!("{} is {:?}", from, status.state);
                self.announce_readiness(outbox);
            }
            Packet::PlayerCursor(mut cursor) => {
                cursor.peer = from;
                self.world_sync.set_viewport(from, cursor.viewport);
                outbox.broadcast_except(from, Packet::PlayerCursor(cursor));
            }
            Packet::Ping(ping) => {
                outbox.send_to(
                    from,
                    Packet::Pong(Pong {
                        timestamp_micros: ping.timestamp_micros,
                    }),
                );
            }
            Packet::Disconnect(disconnect) => {
                info!("{} is leaving: {}", from, disconnect.reason);
            }
            other => bail!("unexpected {:?} from {}", other.packet_type(), from),
        }
        Ok(())
    }
}

/// Per-tick view pairing the session with the authoritative world.
struct HostHandler<'a, W> {
    core: &'a mut HostCore,
    world: &'a W,
}

impl<W: AuthoritativeWorld> PacketHandler for HostHandler<'_, W> {
    fn handle_packet(
        &mut self,
        from: PeerId,
        packet: Packet,
        outbox: &mut Outbox,
        now: Instant,
    ) -> Result<()> {
        self.core.handle_packet(from, packet, outbox, now)
    }

    fn world_access(&mut self) -> WorldAccess<'_> {
        WorldAccess::Authoritative(self.world)
    }
}

/// Authoritative host over an injected transport.
pub struct HostSession<T: Transport> {
    transport: T,
    dispatcher: Dispatcher,
    outbox: Outbox,
    stats: BandwidthStats,
    core: HostCore,
}

impl<T: Transport> HostSession<T> {
    /// Session advertising `manifest` to every peer.
    pub fn new(transport: T, config: SyncConfig, manifest: EnvironmentManifest) -> Self {
        let bulk = BulkSender::new(&config.transfer);
        Self::with_bulk(transport, config, manifest, bulk)
    }

    /// Like [`Self::new`] with reproducible transfer ids.
    pub fn with_seed(
        transport: T,
        config: SyncConfig,
        manifest: EnvironmentManifest,
        seed: u64,
    ) -> Self {
        let bulk = BulkSender::with_seed(&config.transfer, seed);
        Self::with_bulk(transport, config, manifest, bulk)
    }

    fn with_bulk(
        transport: T,
        config: SyncConfig,
        manifest: EnvironmentManifest,
        bulk: BulkSender,
    ) -> Self {
        let world_sync = WorldSynchronizer::new(config.world.clone());
        Self {
            transport,
            dispatcher: Dispatcher::new(PacketRegistry::new()),
            outbox: Outbox::new(),
            stats: BandwidthStats::new(),
            core: HostCore {
                config,
                manifest,
                state: HostState::Stopped,
                connections: ConnectionTable::new(),
                bulk,
                world_sync,
                snapshot_requests: BTreeSet::new(),
                deferred_requests: BTreeSet::new(),
                hard_sync: HardSync::Idle,
            },
        }
    }

    /// Register an external payload kind.
    pub fn register_plugin<P>(&mut self) -> Result<u32>
    where
        P: PluginPayload + Default + 'static,
    {
        self.dispatcher
            .registry_mut()
            .register_plugin::<P>()
            .context("Failed to register plugin packet")
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HostState {
        self.core.state
    }

    /// Identity of this host.
    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Per-peer records.
    pub fn connections(&self) -> &ConnectionTable {
        &self.core.connections
    }

    /// Bulk transfer state.
    pub fn bulk(&self) -> &BulkSender {
        &self.core.bulk
    }

    /// World delta synchronizer.
    pub fn world_sync(&self) -> &WorldSynchronizer {
        &self.core.world_sync
    }

    /// Mutable synchronizer, for the host's own viewport.
    pub fn world_sync_mut(&mut self) -> &mut WorldSynchronizer {
        &mut self.core.world_sync
    }

    /// Traffic counters.
    pub fn stats(&self) -> &BandwidthStats {
        &self.stats
    }

    /// Dispatcher counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// True while a hard sync is requested or in flight.
    pub fn hard_sync_in_progress(&self) -> bool {
        self.core.hard_sync != HardSync::Idle
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Feed the host frame rate into the world sync cadence.
    pub fn set_frame_rate(&mut self, fps: Option<f32>) {
        self.core.world_sync.set_frame_rate(fps);
    }

    /// Open the listen socket and start serving.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.transition(HostState::Preparing);
        self.transition(HostState::Starting);
        if let Err(e) = self.transport.listen() {
            self.transition(HostState::Error);
            return Err(e).context("Failed to start host listener");
        }
        self.core.world_sync.start(now);
        self.transition(HostState::Started);
        Ok(())
    }

    fn transition(&mut self, next: HostState) {
        if self.core.state != next {
            info!("Host state {:?} -> {:?}", self.core.state, next);
            self.core.state = next;
        }
    }

    /// Queue a message for one peer.
    pub fn send_to(&mut self, peer: PeerId, packet: Packet) {
        self.outbox.send_to(peer, packet);
    }

    /// Queue a message for every peer that may receive the world.
    pub fn broadcast(&mut self, packet: Packet) {
        self.outbox.broadcast(packet);
    }

    /// Force every compatible peer to reload the world.
    ///
    /// Returns false when a hard sync is already running.
    pub fn request_hard_sync(&mut self) -> bool {
        if self.core.hard_sync != HardSync::Idle {
            warn!("Hard sync already in progress; ignoring request");
            return false;
        }
        info!("Hard sync requested");
        self.core.hard_sync = HardSync::Requested;
        true
    }

    /// Run one host tick.
    #[instrument(
        skip(self, world),
        fields(state = ?self.core.state, peers = self.core.connections.connected_count())
    )]
    pub fn update<W>(&mut self, now: Instant, world: &mut W) -> HostTickReport
    where
        W: AuthoritativeWorld + SnapshotSource,
    {
        let mut report = HostTickReport::default();
        if !self.core.state.processes_messages() {
            return report;
        }
        self.stats.roll(now);

        for event in self.transport.poll_events() {
            report.events += 1;
            self.handle_event(event, now);
        }

        let max = self.core.config.session.max_messages_per_poll;
        for message in self.transport.receive(max) {
            let Some(peer) = self.transport.peer_of(message.conn) else {
                debug!("Dropping message on unknown {}", message.conn);
                continue;
            };
            self.stats.record_received(message.bytes.len(), now);
            let mut handler = HostHandler {
                core: &mut self.core,
                world: &*world,
            };
            self.dispatcher.dispatch(
                peer,
                &message.bytes,
                &mut handler,
                &mut self.outbox,
                now,
            );
            report.dispatched += 1;
        }

        report.transfers_started += self.run_hard_sync(now, world);
        report.transfers_started += self.serve_snapshot_requests(now, world);
        report.packets_sent += self.flush(now);

        report.bulk = self.pump_bulk(now);
        report.packets_sent += report.bulk.sent + report.bulk.resent;

        report.world = self
            .core
            .world_sync
            .tick(now, &*world, &mut self.outbox);
        report.packets_sent += self.flush(now);
        report
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Incoming { conn, peer } => {
                debug!("Incoming connection {} from {}", conn, peer);
                if let Err(e) = self.transport.accept(conn) {
                    warn!("Failed to accept {} from {}: {}", conn, peer, e);
                }
            }
            TransportEvent::Connected { conn, peer } => {
                let record = self.core.connections.attach(peer, conn);
                info!(
                    "{} connected on {} (connection #{})",
                    peer,
                    conn,
                    record.connect_count()
                );
                if record.compatibility_checked() && record.compatible() {
                    info!("{} already passed the handshake; resuming", peer);
                    self.core.bulk.on_reconnect(peer, now);
                } else {
                    self.outbox.send_to(
                        peer,
                        Packet::CompatibilityManifest(CompatibilityManifest::new(
                            self.core.manifest.clone(),
                        )),
                    );
                }
                self.core.refresh_mod_sync_state();
            }
            TransportEvent::Closed { conn, peer, reason } => {
                let Some(peer) = self.core.connections.detach(conn) else {
                    debug!("Close on untracked {} ({}): {}", conn, peer, reason);
                    return;
                };
                info!("{} disconnected: {}", peer, reason);
                self.core.bulk.on_disconnect(peer);
                self.core.world_sync.remove_viewport(peer);
                self.core.snapshot_requests.remove(&peer);
                self.core.deferred_requests.remove(&peer);
                self.core.refresh_mod_sync_state();
                self.core.announce_readiness(&mut self.outbox);
            }
        }
    }

    fn capture<W: SnapshotSource>(world: &mut W) -> Option<(String, Arc<[u8]>)> {
        match world.capture() {
            Ok(snapshot) => {
                debug!(
                    "Captured snapshot {} ({} bytes)",
                    snapshot.name,
                    snapshot.bytes.len()
                );
                Some((snapshot.name, snapshot.bytes.into()))
            }
            Err(e) => {
                error!("Failed to capture world snapshot: {}", e);
                None
            }
        }
    }

    fn run_hard_sync<W: SnapshotSource>(&mut self, now: Instant, world: &mut W) -> usize {
        if self.core.hard_sync != HardSync::Requested {
            return 0;
        }
        let Some((name, payload)) = Self::capture(world) else {
            self.core.hard_sync = HardSync::Idle;
            return 0;
        };

        mark_all_unready(&mut self.core.connections);
        self.outbox.broadcast(Packet::HardSync);
        let targets = self.core.connections.world_targets(None);
        for (peer, _) in &targets {
            self.core.bulk.cancel_peer(*peer);
            self.core.snapshot_requests.remove(peer);
            self.core.bulk.start(*peer, &name, payload.clone(), now);
        }
        info!("Hard sync started for {} peer(s)", targets.len());
        self.core.hard_sync = if targets.is_empty() {
            HardSync::Idle
        } else {
            HardSync::Running
        };
        targets.len()
    }

    fn serve_snapshot_requests<W: SnapshotSource>(&mut self, now: Instant, world: &mut W) -> usize {
        if self.core.snapshot_requests.is_empty() {
            return 0;
        }
        let requests = std::mem::take(&mut self.core.snapshot_requests);
        let Some((name, payload)) = Self::capture(world) else {
            warn!(
                "Dropping {} snapshot request(s); peers must reconnect",
                requests.len()
            );
            return 0;
        };

        let mut started = 0;
        for peer in requests {
            let eligible = self
                .core
                .connections
                .get(peer)
                .is_some_and(|record| record.can_receive_world());
            if !eligible {
                continue;
            }
            self.core.bulk.cancel_peer(peer);
            self.core.bulk.start(peer, &name, payload.clone(), now);
            started += 1;
        }
        started
    }

    fn pump_bulk(&mut self, now: Instant) -> PumpReport {
        let transport = &mut self.transport;
        let registry = self.dispatcher.registry();
        let stats = &mut self.stats;
        let connections = &self.core.connections;
        self.core.bulk.pump(now, |peer, packet| {
            let conn = connections
                .conn_of(peer)
                .ok_or(TransportError::NotConnected(peer))?;
            let bytes = registry.encode(&packet);
            transport.send(conn, &bytes, packet.default_send_mode())?;
            stats.record_sent(bytes.len(), now);
            Ok(())
        })
    }

    fn flush(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        for envelope in self.outbox.drain() {
            let targets: Vec<(PeerId, ConnectionHandle)> = match envelope.to {
                Destination::Peer(peer) => self
                    .core
                    .connections
                    .conn_of(peer)
                    .map(|conn| vec![(peer, conn)])
                    .unwrap_or_default(),
                Destination::Broadcast => self.broadcast_targets(&envelope.packet, None),
                Destination::BroadcastExcept(skip) => {
                    self.broadcast_targets(&envelope.packet, Some(skip))
                }
            };
            if targets.is_empty() {
                continue;
            }
            let bytes = self.dispatcher.registry().encode(&envelope.packet);
            for (peer, conn) in targets {
                match self.transport.send(conn, &bytes, envelope.mode) {
                    Ok(()) => {
                        self.stats.record_sent(bytes.len(), now);
                        sent += 1;
                    }
                    Err(e) => warn!(
                        "Failed to send {:?} to {}: {}",
                        envelope.packet.packet_type(),
                        peer,
                        e
                    ),
                }
            }
        }
        sent
    }

    fn broadcast_targets(
        &self,
        packet: &Packet,
        skip: Option<PeerId>,
    ) -> Vec<(PeerId, ConnectionHandle)> {
        if matches!(packet, Packet::Disconnect(_)) {
            return self
                .core
                .connections
                .connected()
                .filter(|record| Some(record.peer()) != skip)
                .filter_map(|record| record.conn().map(|conn| (record.peer(), conn)))
                .collect();
        }
        self.core.connections.world_targets(skip)
    }

    /// Say goodbye, close every connection and drop all transfers.
    #[instrument(skip(self), fields(peers = self.core.connections.connected_count()))]
    pub fn shutdown(&mut self, now: Instant, reason: &str) {
        if self.core.state == HostState::Stopped {
            return;
        }
        self.outbox.broadcast(Packet::Disconnect(Disconnect {
            reason: reason.to_string(),
        }));
        self.flush(now);

        let open: Vec<ConnectionHandle> = self
            .core
            .connections
            .connected()
            .filter_map(|record| record.conn())
            .collect();
        for conn in open {
            self.transport.close(conn, reason);
            self.core.connections.detach(conn);
        }

        let cancelled = self.core.bulk.shutdown();
        if cancelled > 0 {
            info!("Cancelled {} transfer(s) on shutdown", cancelled);
        }
        self.core.world_sync.reset();
        self.core.snapshot_requests.clear();
        self.core.deferred_requests.clear();
        self.core.hard_sync = HardSync::Idle;
        self.transition(HostState::Stopped);
    }
}
