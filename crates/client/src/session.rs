//! Client session: connection lifecycle, handshake reply, snapshot download
//! and world replication, driven from [`ClientSession::poll`].

use crate::apply::{
    apply_world_update, index_buildings, marker_set, reconcile_markers, ApplyReport,
    MarkerReport,
};
use crate::download::{ChunkOutcome, SnapshotDownload};
use anyhow::{bail, Context, Result};
use colonysync_core::{
    CellRect, IdentityRegistry, MarkerKey, NetId, PeerId, ReplicaWorld, SyncConfig, WorldSnapshot,
};
use colonysync_net::protocol::{Disconnect, Ping, PlayerCursor, ReadyStatus, SnapshotRequest};
use colonysync_net::{
    check_compatibility, BandwidthStats, CompatibilityVerdict, ConnectionHandle, DispatchStats,
    Dispatcher, EnvironmentManifest, Outbox, Packet, PacketHandler, PacketRegistry, PluginPayload,
    ReadyState, Transport, TransportEvent, WorldAccess,
};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Client lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection.
    Disconnected,
    /// Connect requested; waiting for the transport.
    Connecting,
    /// Connection open; handshake or snapshot download under way.
    Connected,
    /// Snapshot received; the local world is being replaced.
    LoadingWorld,
    /// World loaded and receiving live updates.
    InGame,
    /// The connect attempt or world load failed.
    Error,
}

impl ClientState {
    /// States in which traffic may be sent to the host.
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            ClientState::Connected | ClientState::LoadingWorld | ClientState::InGame
        )
    }
}

/// What one [`ClientSession::poll`] did.
#[derive(Debug, Clone, Default)]
pub struct ClientTickReport {
    /// Transport lifecycle events handled.
    pub events: usize,
    /// Inbound messages dispatched.
    pub dispatched: usize,
    /// World-update records applied.
    pub cells: ApplyReport,
    /// Marker reconciliation changes.
    pub markers: MarkerReport,
    /// A received snapshot was loaded this poll.
    pub world_loaded: bool,
    /// A stalled download was restarted.
    pub full_resend: bool,
    /// Packets handed to the transport.
    pub packets_sent: usize,
}

/// Host readiness broadcast as last seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyView {
    /// Peers reported ready.
    pub ready: i32,
    /// Peers counted.
    pub total: i32,
    /// The host reported that everyone is ready.
    pub all_ready: bool,
}

/// Session state the packet handlers mutate.
struct ClientCore {
    config: SyncConfig,
    manifest: EnvironmentManifest,
    local: PeerId,
    state: ClientState,
    host: Option<PeerId>,
    conn: Option<ConnectionHandle>,
    cached_host: Option<PeerId>,
    download: SnapshotDownload,
    pending_load: Option<WorldSnapshot>,
    has_world: bool,
    buildings: IdentityRegistry<MarkerKey>,
    verdict: Option<CompatibilityVerdict>,
    ready: ReadyView,
    cursors: BTreeMap<PeerId, PlayerCursor>,
    epoch: Instant,
    last_ping: Option<Instant>,
    latency_ms: Option<f64>,
}

impl ClientCore {
    fn transition(&mut self, next: ClientState) {
        if self.state != next {
            info!("Client state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn clock_micros(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.epoch).as_micros() as i64
    }

    fn host_or_unknown(&self) -> PeerId {
        self.host.unwrap_or(PeerId::UNKNOWN)
    }
}

/// Per-poll view pairing the session with the local world.
struct ClientHandler<'a, W> {
    core: &'a mut ClientCore,
    world: &'a mut W,
    report: &'a mut ClientTickReport,
}

impl<W: ReplicaWorld> PacketHandler for ClientHandler<'_, W> {
    fn handle_packet(
        &mut self,
        from: PeerId,
        packet: Packet,
        outbox: &mut Outbox,
        now: Instant,
    ) -> Result<()> {
        let core = &mut *self.core;
        match packet {
            Packet::CompatibilityManifest(received) => {
                let verdict = check_compatibility(
                    &received.manifest,
                    &core.manifest,
                    &core.config.compatibility,
                );
                if verdict.compatible {
                    info!(
                        "Compatible with host manifest {:016x}: {}",
                        received.manifest_hash, verdict.reason
                    );
                } else {
                    warn!(
                        "Incompatible with host manifest {:016x}: {}",
                        received.manifest_hash, verdict.reason
                    );
                }
                for warning in &verdict.warnings {
                    warn!("Compatibility warning: {}", warning);
                }
                outbox.send_to(from, Packet::CompatibilityReply(verdict.to_reply()));
                core.verdict = Some(verdict);
            }
            Packet::SecureTransfer(envelope) => {
                if !matches!(core.state, ClientState::Connected | ClientState::InGame) {
                    debug!("Ignoring chunk {} while {:?}", envelope.sequence, core.state);
                    return Ok(());
                }
                let local = core.local;
                if let ChunkOutcome::Complete(snapshot) =
                    core.download.on_envelope(local, from, &envelope, outbox, now)
                {
                    core.pending_load = Some(snapshot);
                    core.transition(ClientState::LoadingWorld);
                }
            }
            Packet::ReadyStatusUpdate(update) => {
                core.ready = ReadyView {
                    ready: update.ready,
                    total: update.total,
                    all_ready: false,
                };
                debug!("Host reports {}/{} ready", update.ready, update.total);
            }
            Packet::AllClientsReady => {
                core.ready.all_ready = true;
                core.ready.ready = core.ready.total;
                info!("Every client is ready");
            }
            Packet::HardSync => {
                info!("Host started a hard sync; dropping local world state");
                core.download.reset();
                core.pending_load = None;
                core.has_world = false;
                core.buildings.clear();
                core.transition(ClientState::Connected);
                outbox.send_to(
                    from,
                    Packet::ReadyStatus(ReadyStatus {
                        state: ReadyState::Unready,
                    }),
                );
            }
            Packet::WorldUpdate(update) => {
                if core.state != ClientState::InGame {
                    trace!("Ignoring world update while {:?}", core.state);
                    return Ok(());
                }
                let applied = apply_world_update(&mut *self.world, &update.updates);
                self.report.cells.merge(applied);
            }
            Packet::DiggingState(_) | Packet::ChoreState(_) | Packet::BuildingState(_) => {
                if core.state != ClientState::InGame {
                    trace!("Ignoring marker set while {:?}", core.state);
                    return Ok(());
                }
                if let Some((category, remote)) = marker_set(&packet) {
                    let changes =
                        reconcile_markers(&mut *self.world, category, &remote, &mut core.buildings);
                    self.report.markers.merge(changes);
                }
            }
            Packet::PlayerCursor(cursor) => {
                core.cursors.insert(cursor.peer, cursor);
            }
            Packet::Pong(pong) => {
                let rtt_micros = core.clock_micros(now) - pong.timestamp_micros;
                if rtt_micros >= 0 {
                    core.latency_ms = Some(rtt_micros as f64 / 1000.0);
                    trace!("Round trip {} us", rtt_micros);
                }
            }
            Packet::Disconnect(disconnect) => {
                info!("Host is closing the session: {}", disconnect.reason);
            }
            other => bail!("unexpected {:?} from {}", other.packet_type(), from),
        }
        Ok(())
    }

    fn world_access(&mut self) -> WorldAccess<'_> {
        WorldAccess::Replica(&mut *self.world)
    }
}

/// Passive replica connected to one host over an injected transport.
pub struct ClientSession<T: Transport> {
    transport: T,
    dispatcher: Dispatcher,
    outbox: Outbox,
    stats: BandwidthStats,
    core: ClientCore,
}

impl<T: Transport> ClientSession<T> {
    /// Session that will present `manifest` during the handshake.
    pub fn new(
        transport: T,
        config: SyncConfig,
        manifest: EnvironmentManifest,
        now: Instant,
    ) -> Self {
        let local = transport.local_peer();
        let download = SnapshotDownload::new(config.download.clone());
        Self {
            transport,
            dispatcher: Dispatcher::new(PacketRegistry::new()),
            outbox: Outbox::new(),
            stats: BandwidthStats::new(),
            core: ClientCore {
                config,
                manifest,
                local,
                state: ClientState::Disconnected,
                host: None,
                conn: None,
                cached_host: None,
                download,
                pending_load: None,
                has_world: false,
                buildings: IdentityRegistry::new(),
                verdict: None,
                ready: ReadyView::default(),
                cursors: BTreeMap::new(),
                epoch: now,
                last_ping: None,
                latency_ms: None,
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
    pub fn state(&self) -> ClientState {
        self.core.state
    }

    /// Identity of this client.
    pub fn local_peer(&self) -> PeerId {
        self.core.local
    }

    /// Host this session talks to, if any.
    pub fn host(&self) -> Option<PeerId> {
        self.core.host
    }

    /// Host remembered for [`Self::reconnect_from_cache`].
    pub fn cached_host(&self) -> Option<PeerId> {
        self.core.cached_host
    }

    /// True once a snapshot has been loaded.
    pub fn has_world(&self) -> bool {
        self.core.has_world
    }

    /// Network id of a replicated building.
    pub fn building_id(&self, key: MarkerKey) -> Option<NetId> {
        self.core.buildings.id_of(key)
    }

    /// Building registered under `id`.
    pub fn building(&self, id: NetId) -> Option<MarkerKey> {
        self.core.buildings.try_get(id)
    }

    /// Snapshot download state.
    pub fn download(&self) -> &SnapshotDownload {
        &self.core.download
    }

    /// Verdict on the last host manifest.
    pub fn verdict(&self) -> Option<&CompatibilityVerdict> {
        self.core.verdict.as_ref()
    }

    /// Present `manifest` at the next handshake, e.g. after installing mods.
    pub fn set_manifest(&mut self, manifest: EnvironmentManifest) {
        self.core.manifest = manifest;
    }

    /// Readiness as last reported by the host.
    pub fn ready_view(&self) -> ReadyView {
        self.core.ready
    }

    /// Cursors relayed from other peers.
    pub fn remote_cursors(&self) -> &BTreeMap<PeerId, PlayerCursor> {
        &self.core.cursors
    }

    /// Last measured round trip.
    pub fn latency_ms(&self) -> Option<f64> {
        self.core.latency_ms
    }

    /// Traffic counters.
    pub fn stats(&self) -> &BandwidthStats {
        &self.stats
    }

    /// Dispatcher counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start connecting to `host`.
    #[instrument(skip(self), fields(state = ?self.core.state))]
    pub fn connect(&mut self, host: PeerId) -> Result<()> {
        if matches!(
            self.core.state,
            ClientState::Connecting | ClientState::Connected | ClientState::InGame
        ) {
            bail!("already {:?}", self.core.state);
        }
        self.core.transition(ClientState::Connecting);
        match self.transport.connect(host) {
            Ok(conn) => {
                debug!("Connecting to {} on {}", host, conn);
                self.core.host = Some(host);
                self.core.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                self.core.transition(ClientState::Error);
                Err(e).with_context(|| format!("Failed to connect to {}", host))
            }
        }
    }

    /// Reconnect to the last host that accepted us.
    pub fn reconnect_from_cache(&mut self) -> Result<()> {
        let Some(host) = self.core.cached_host else {
            bail!("no cached host to reconnect to");
        };
        info!("Reconnecting to cached host {}", host);
        self.connect(host)
    }

    /// Say goodbye and close the connection.
    pub fn disconnect(&mut self, now: Instant, reason: &str) {
        if let Some(host) = self.core.host {
            self.outbox.send_to(
                host,
                Packet::Disconnect(Disconnect {
                    reason: reason.to_string(),
                }),
            );
            self.flush(now);
        }
        if let Some(conn) = self.core.conn.take() {
            self.transport.close(conn, reason);
        }
        self.outbox.drain();
        self.core.download.reset();
        self.core.pending_load = None;
        self.core.cached_host = None;
        self.core.host = None;
        self.core.transition(ClientState::Disconnected);
    }

    /// Queue this client's cursor and viewport for the host.
    pub fn send_cursor(&mut self, x: f32, y: f32, viewport: CellRect) {
        if !self.core.state.can_send() {
            return;
        }
        let host = self.core.host_or_unknown();
        self.outbox.send_to(
            host,
            Packet::PlayerCursor(PlayerCursor {
                peer: self.core.local,
                x,
                y,
                viewport,
            }),
        );
    }

    /// Run one client tick against the local world.
    #[instrument(skip(self, world), fields(state = ?self.core.state, host = ?self.core.host))]
    pub fn poll<W>(&mut self, now: Instant, world: &mut W) -> ClientTickReport
    where
        W: ReplicaWorld,
    {
        let mut report = ClientTickReport::default();
        self.stats.roll(now);

        for event in self.transport.poll_events() {
            report.events += 1;
            self.handle_event(event, now);
        }

        report.world_loaded = self.finish_load(world);

        if self.core.conn.is_some() {
            let max = self.core.config.session.max_messages_per_poll;
            for message in self.transport.receive(max) {
                if Some(message.conn) != self.core.conn {
                    debug!("Dropping message on stale {}", message.conn);
                    continue;
                }
                let from = self.core.host_or_unknown();
                self.stats.record_received(message.bytes.len(), now);
                let mut handler = ClientHandler {
                    core: &mut self.core,
                    world: &mut *world,
                    report: &mut report,
                };
                self.dispatcher
                    .dispatch(from, &message.bytes, &mut handler, &mut self.outbox, now);
                report.dispatched += 1;
            }
        }

        if self.core.state == ClientState::Connected {
            let local = self.core.local;
            let host = self.core.host_or_unknown();
            report.full_resend = self
                .core
                .download
                .check_stall(local, host, &mut self.outbox, now);
        }

        self.maybe_ping(now);
        report.packets_sent = self.flush(now);
        report
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Incoming { conn, peer } => {
                debug!("Refusing inbound {} from {}", conn, peer);
                self.transport.close(conn, "clients do not accept connections");
            }
            TransportEvent::Connected { conn, peer } => {
                if Some(conn) != self.core.conn {
                    debug!("Connected event for stale {} ({})", conn, peer);
                    return;
                }
                info!("Connected to {} on {}", peer, conn);
                self.core.host = Some(peer);
                self.core.cached_host = Some(peer);
                self.core.last_ping = None;
                self.core.transition(ClientState::Connected);
                self.announce(ReadyState::Unready);

                if self.core.has_world {
                    self.core.transition(ClientState::InGame);
                    self.announce(ReadyState::Ready);
                } else if self.core.download.in_progress() {
                    info!("Waiting for the host to resume the interrupted download");
                    self.core.download.await_resume(now);
                } else {
                    self.outbox.send_to(
                        peer,
                        Packet::SnapshotRequest(SnapshotRequest {
                            requester: self.core.local,
                        }),
                    );
                }
            }
            TransportEvent::Closed { conn, peer, reason } => {
                if Some(conn) != self.core.conn {
                    trace!("Close for stale {} ({}): {}", conn, peer, reason);
                    return;
                }
                self.core.conn = None;
                match self.core.state {
                    ClientState::LoadingWorld => {
                        debug!(
                            "Connection to {} closed during world load; reconnecting afterwards",
                            peer
                        );
                    }
                    ClientState::Error => {}
                    _ => {
                        warn!("Connection to {} closed: {}", peer, reason);
                        self.core.transition(ClientState::Disconnected);
                    }
                }
            }
        }
    }

    fn announce(&mut self, state: ReadyState) {
        let host = self.core.host_or_unknown();
        self.outbox
            .send_to(host, Packet::ReadyStatus(ReadyStatus { state }));
    }

    fn finish_load<W: ReplicaWorld + ?Sized>(&mut self, world: &mut W) -> bool {
        let Some(snapshot) = self.core.pending_load.take() else {
            return false;
        };
        let name = snapshot.name.clone();
        if let Err(e) = world
            .load_snapshot(snapshot)
            .with_context(|| format!("Failed to load snapshot {}", name))
        {
            error!("{:#}", e);
            self.core.transition(ClientState::Error);
            return false;
        }
        let buildings = index_buildings(&*world, &mut self.core.buildings);
        info!("Loaded world {} ({} buildings)", name, buildings);
        self.core.has_world = true;

        if self.core.conn.is_some() {
            self.core.transition(ClientState::InGame);
            self.announce(ReadyState::Ready);
        } else {
            self.core.transition(ClientState::Disconnected);
            if let Err(e) = self.reconnect_from_cache() {
                warn!("Failed to reconnect after world load: {:#}", e);
            }
        }
        true
    }

    fn maybe_ping(&mut self, now: Instant) {
        if self.core.conn.is_none() || !self.core.state.can_send() {
            return;
        }
        let due = self.core.last_ping.map_or(true, |at| {
            now.saturating_duration_since(at) >= self.core.config.session.ping_interval()
        });
        if !due {
            return;
        }
        self.core.last_ping = Some(now);
        let host = self.core.host_or_unknown();
        let timestamp_micros = self.core.clock_micros(now);
        self.outbox
            .send_to(host, Packet::Ping(Ping { timestamp_micros }));
    }

    fn flush(&mut self, now: Instant) -> usize {
        let envelopes = self.outbox.drain();
        let Some(conn) = self.core.conn else {
            if !envelopes.is_empty() {
                trace!("Dropping {} packet(s) with no connection", envelopes.len());
            }
            return 0;
        };
        let mut sent = 0;
        for envelope in envelopes {
            let bytes = self.dispatcher.registry().encode(&envelope.packet);
            match self.transport.send(conn, &bytes, envelope.mode) {
                Ok(()) => {
                    self.stats.record_sent(bytes.len(), now);
                    sent += 1;
                }
                Err(e) => warn!(
                    "Failed to send {:?} to host: {}",
                    envelope.packet.packet_type(),
                    e
                ),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colonysync_core::{CellState, GridSize, MarkerCategory, MarkerKey};
    use colonysync_net::protocol::{
        ChoreState, CompatibilityManifest, Pong, SecureTransfer, SnapshotChunk, WorldUpdate,
    };
    use colonysync_net::{encode_packet, CellUpdate, InboundMessage, PacketType};
    use colonysync_testkit::{GridWorld, LoopbackNetwork, LoopbackTransport};
    use std::time::Duration;

    const HOST: PeerId = PeerId(1);
    const GUEST: PeerId = PeerId(2);

    /// Hand-driven host end of the loopback link.
    struct Rig {
        net: LoopbackNetwork,
        host: LoopbackTransport,
        host_conn: Option<ConnectionHandle>,
        client: ClientSession<LoopbackTransport>,
        world: GridWorld,
        now: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let net = LoopbackNetwork::new();
            let mut host = net.endpoint(HOST);
            host.listen().expect("listen");
            let now = Instant::now();
            let client = ClientSession::new(
                net.endpoint(GUEST),
                SyncConfig::default(),
                EnvironmentManifest::new("1.0"),
                now,
            );
            Self {
                net,
                host,
                host_conn: None,
                client,
                world: GridWorld::new(GridSize::new(8, 8)),
                now,
            }
        }

        fn poll(&mut self) -> ClientTickReport {
            self.now += Duration::from_millis(50);
            self.client.poll(self.now, &mut self.world)
        }

        fn accept(&mut self) {
            for event in self.host.poll_events() {
                if let TransportEvent::Incoming { conn, .. } = event {
                    self.host.accept(conn).expect("accept");
                    self.host_conn = Some(conn);
                }
            }
        }

        fn join(&mut self) {
            self.client.connect(HOST).expect("connect");
            self.accept();
            self.poll();
        }

        fn host_send(&mut self, packet: Packet) {
            let conn = self.host_conn.expect("host connection");
            self.host
                .send(conn, &encode_packet(&packet), packet.default_send_mode())
                .expect("host send");
        }

        fn host_inbox(&mut self) -> Vec<Packet> {
            let registry = PacketRegistry::new();
            self.host
                .receive(usize::MAX)
                .into_iter()
                .map(|m: InboundMessage| registry.decode(&m.bytes).expect("client packets decode"))
                .collect()
        }

        fn deliver_snapshot(&mut self, bytes: &[u8], chunk_size: usize) {
            for (seq, slice) in bytes.chunks(chunk_size).enumerate() {
                let chunk = SnapshotChunk {
                    file_name: "colony.sav".to_string(),
                    offset: (seq * chunk_size) as i32,
                    total_size: bytes.len() as i32,
                    data: slice.to_vec(),
                };
                self.host_send(Packet::SecureTransfer(SecureTransfer {
                    sequence: seq as i32,
                    transfer_id: "t1".to_string(),
                    payload: chunk.encode(),
                }));
            }
        }
    }

    fn snapshot_bytes() -> Vec<u8> {
        let mut source = GridWorld::new(GridSize::new(8, 8));
        source.set_element(10, 42);
        source.add_marker(MarkerCategory::Mop, MarkerKey::new(3, 0));
        source.snapshot_bytes().expect("serialize")
    }

    #[test]
    fn test_connect_failure_enters_error() {
        let net = LoopbackNetwork::new();
        let mut client = ClientSession::new(
            net.endpoint(GUEST),
            SyncConfig::default(),
            EnvironmentManifest::new("1.0"),
            Instant::now(),
        );
        assert!(client.connect(HOST).is_err());
        assert_eq!(client.state(), ClientState::Error);
    }

    #[test]
    fn test_join_requests_snapshot() {
        let mut rig = Rig::new();
        rig.client.connect(HOST).expect("connect");
        assert_eq!(rig.client.state(), ClientState::Connecting);
        rig.accept();
        rig.poll();

        assert_eq!(rig.client.state(), ClientState::Connected);
        assert_eq!(rig.client.cached_host(), Some(HOST));
        let kinds: Vec<PacketType> = rig.host_inbox().iter().map(Packet::packet_type).collect();
        assert_eq!(
            kinds,
            vec![PacketType::ReadyStatus, PacketType::SnapshotRequest, PacketType::Ping]
        );
    }

    #[test]
    fn test_manifest_answered_with_verdict() {
        let mut rig = Rig::new();
        rig.join();
        rig.host_inbox();

        rig.host_send(Packet::CompatibilityManifest(CompatibilityManifest::new(
            EnvironmentManifest::new("1.0").with_mod("Pipes", "2"),
        )));
        rig.poll();

        let inbox = rig.host_inbox();
        let [Packet::CompatibilityReply(reply)] = inbox.as_slice() else {
            panic!("expected one compatibility reply, got {:?}", inbox);
        };
        assert!(!reply.compatible);
        assert_eq!(reply.missing, vec!["Pipes".to_string()]);
        assert!(!rig.client.verdict().expect("verdict").compatible);
    }

    #[test]
    fn test_snapshot_loads_then_reports_ready() {
        let mut rig = Rig::new();
        rig.join();
        rig.host_inbox();

        let bytes = snapshot_bytes();
        rig.deliver_snapshot(&bytes, 256);
        rig.poll();
        assert_eq!(rig.client.state(), ClientState::LoadingWorld);

        let report = rig.poll();
        assert!(report.world_loaded);
        assert_eq!(rig.client.state(), ClientState::InGame);
        assert_eq!(rig.world.cell(10).element, 42);
        assert!(rig
            .host_inbox()
            .contains(&Packet::ReadyStatus(ReadyStatus { state: ReadyState::Ready })));
    }

    #[test]
    fn test_close_during_load_reconnects_from_cache() {
        let mut rig = Rig::new();
        rig.join();
        rig.deliver_snapshot(&snapshot_bytes(), 256);
        rig.poll();
        assert_eq!(rig.client.state(), ClientState::LoadingWorld);

        rig.net.sever(GUEST);
        rig.poll();
        assert!(rig.client.has_world());
        assert_eq!(rig.client.state(), ClientState::Connecting);
        assert_eq!(rig.client.cached_host(), Some(HOST));

        rig.host_inbox();
        rig.accept();
        rig.poll();
        assert_eq!(rig.client.state(), ClientState::InGame);
        let kinds: Vec<PacketType> = rig.host_inbox().iter().map(Packet::packet_type).collect();
        assert!(!kinds.contains(&PacketType::SnapshotRequest));
    }

    #[test]
    fn test_updates_applied_only_in_game() {
        let mut rig = Rig::new();
        rig.join();
        let water = CellState {
            element: 9,
            temperature: 290.0,
            mass: 30.0,
            disease: 0,
            disease_count: 0,
        };
        rig.host_send(Packet::WorldUpdate(WorldUpdate::new(vec![CellUpdate::new(4, water)], 3)));
        let early = rig.poll();
        assert_eq!(early.cells.applied, 0);

        rig.deliver_snapshot(&snapshot_bytes(), 256);
        rig.poll();
        rig.poll();
        assert_eq!(rig.client.state(), ClientState::InGame);

        rig.host_send(Packet::WorldUpdate(WorldUpdate::new(vec![CellUpdate::new(4, water)], 3)));
        rig.host_send(Packet::ChoreState(ChoreState {
            chores: vec![MarkerKey::new(6, 0)],
        }));
        let report = rig.poll();
        assert_eq!(report.cells.applied, 1);
        assert_eq!(report.markers.removed, 1);
        assert_eq!(report.markers.spawned, 1);
        assert_eq!(rig.world.cell(4).element, 9);
    }

    #[test]
    fn test_hard_sync_drops_world_and_reports_unready() {
        let mut rig = Rig::new();
        rig.join();
        rig.deliver_snapshot(&snapshot_bytes(), 256);
        rig.poll();
        rig.poll();
        rig.host_inbox();

        rig.host_send(Packet::HardSync);
        rig.poll();
        assert_eq!(rig.client.state(), ClientState::Connected);
        assert!(!rig.client.has_world());
        assert!(rig
            .host_inbox()
            .contains(&Packet::ReadyStatus(ReadyStatus { state: ReadyState::Unready })));
    }

    #[test]
    fn test_pong_records_latency_and_unexpected_fails() {
        let mut rig = Rig::new();
        rig.join();
        let sent_at = rig.client.core.clock_micros(rig.now);
        rig.host_send(Packet::Pong(Pong {
            timestamp_micros: sent_at,
        }));
        rig.host_send(Packet::SnapshotRequest(SnapshotRequest { requester: HOST }));
        rig.poll();

        let latency = rig.client.latency_ms().expect("latency");
        assert!((latency - 50.0).abs() < 1.0);
        assert_eq!(rig.client.dispatch_stats().failed, 1);
    }

    #[test]
    fn test_cursor_sent_and_relayed_cursors_stored() {
        let mut rig = Rig::new();
        rig.join();
        rig.host_inbox();

        rig.client.send_cursor(3.0, 4.0, CellRect::new(0, 0, 5, 5));
        rig.host_send(Packet::PlayerCursor(PlayerCursor {
            peer: PeerId(3),
            x: 1.0,
            y: 1.0,
            viewport: CellRect::new(1, 1, 2, 2),
        }));
        rig.poll();

        assert!(rig.client.remote_cursors().contains_key(&PeerId(3)));
        assert!(rig
            .host_inbox()
            .iter()
            .any(|p| matches!(p, Packet::PlayerCursor(c) if c.peer == GUEST)));
    }

    #[test]
    fn test_disconnect_says_goodbye() {
        let mut rig = Rig::new();
        rig.join();
        rig.host_inbox();

        let now = rig.now;
        rig.client.disconnect(now, "quit");
        assert_eq!(rig.client.state(), ClientState::Disconnected);
        assert!(rig.client.reconnect_from_cache().is_err());
        assert!(rig
            .host_inbox()
            .iter()
            .any(|p| matches!(p, Packet::Disconnect(d) if d.reason == "quit")));
    }
}
