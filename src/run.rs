//! In-process host plus loopback clients.
//!
//! The run has three phases. Clients join and download the world while the
//! host world stands still. Once every client is in game and the host has
//! taken its first cell baseline, the host world mutates every tick. The
//! final `SETTLE_TICKS` leave the world alone so the last deltas and marker
//! sets reach every replica before comparison.

use anyhow::{Context, Result};
use colonysync_client::{ClientSession, ClientState};
use colonysync_core::{GridSize, MarkerCategory, MarkerKey, PeerId, SyncConfig};
use colonysync_net::{compute_protocol_hash, BandwidthStats, EnvironmentManifest, PacketType};
use colonysync_server::{HostSession, HostState};
use colonysync_testkit::{
    EndpointMetrics, EventRecord, GridWorld, JsonlSink, LinkSummary, LoopbackNetwork,
    LoopbackTransport, RunReport, RunReportBuilder, TransferSummary,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Simulated frame length.
pub const TICK: Duration = Duration::from_millis(50);

/// Quiet ticks at the end of a run.
pub const SETTLE_TICKS: u64 = 120;

const HOST_PEER: PeerId = PeerId(1);
const GRID: GridSize = GridSize::new(64, 64);
const CURSOR_EVERY: u64 = 20;

/// Shape of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Loopback clients to start.
    pub clients: usize,
    /// Host ticks to run.
    pub ticks: u64,
    /// Padding added to the snapshot.
    pub snapshot_bytes: usize,
    /// Drop every Kth chunk ack; 0 disables.
    pub drop_every: u64,
    /// Seed for transfer ids and world mutations.
    pub seed: u64,
}

struct Replica {
    session: ClientSession<LoopbackTransport>,
    world: GridWorld,
    last_state: ClientState,
}

/// Environment manifest for this build.
pub fn local_manifest() -> EnvironmentManifest {
    EnvironmentManifest::new(format!(
        "{}+{:016x}",
        env!("CARGO_PKG_VERSION"),
        compute_protocol_hash()
    ))
}

fn seed_world(world: &mut GridWorld, rng: &mut StdRng) {
    for _ in 0..32 {
        let cell = rng.gen_range(0..GRID.cell_count() as i32);
        world.add_marker(MarkerCategory::Dig, MarkerKey::new(cell, 0));
    }
    for _ in 0..8 {
        let cell = rng.gen_range(0..GRID.cell_count() as i32);
        world.add_marker(MarkerCategory::Mop, MarkerKey::new(cell, 0));
    }
    for (i, name) in ["Ladder", "Tile", "Door"].iter().enumerate() {
        world.add_building(100 + i as i32 * 7, name);
    }
}

fn mutate_world(world: &mut GridWorld, rng: &mut StdRng) {
    for _ in 0..16 {
        let cell = rng.gen_range(0..GRID.cell_count() as i32);
        world.set_mass(cell, rng.gen_range(1..2000) as f32);
    }
    if rng.gen_bool(0.2) {
        let cell = rng.gen_range(0..GRID.cell_count() as i32);
        world.set_element(cell, rng.gen_range(1..40));
    }
    if rng.gen_bool(0.1) {
        let cell = rng.gen_range(0..GRID.cell_count() as i32);
        let key = MarkerKey::new(cell, 0);
        if !world.clear_marker(MarkerCategory::Dig, key) {
            world.add_marker(MarkerCategory::Dig, key);
        }
    }
}

fn endpoint_metrics(peer: PeerId, state: String, stats: &BandwidthStats) -> EndpointMetrics {
    EndpointMetrics {
        peer: peer.0,
        state,
        packets_sent: stats.packets_sent,
        packets_received: stats.packets_received,
        bytes_sent: stats.bytes_sent,
        bytes_received: stats.bytes_received,
        latency_ms: None,
        in_sync: None,
    }
}

fn log_event(sink: &mut Option<JsonlSink>, tick: u64, peer: PeerId, kind: &str, detail: &str) {
    if let Some(sink) = sink.as_mut() {
        if let Err(e) = sink.write(&EventRecord::now(tick, peer, kind, detail)) {
            warn!("Failed to write event: {:#}", e);
        }
    }
}

/// Run one scenario and report how it went.
pub fn run(
    config: &SyncConfig,
    options: &RunOptions,
    mut events: Option<JsonlSink>,
) -> Result<RunReport> {
    let net = LoopbackNetwork::new();
    if options.drop_every > 0 {
        info!("Dropping every {}th chunk ack", options.drop_every);
        net.drop_every(options.drop_every, Some(PacketType::ChunkAck));
    }

    let mut now = Instant::now();
    let manifest = local_manifest();
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut host = HostSession::with_seed(
        net.endpoint(HOST_PEER),
        config.clone(),
        manifest.clone(),
        options.seed,
    );
    host.start(now).context("Failed to start host")?;
    host.world_sync_mut().set_host_viewport(Some(GRID.bounds()));
    log_event(&mut events, 0, HOST_PEER, "host_started", "");

    let mut host_world = GridWorld::new(GRID);
    host_world.set_ballast(options.snapshot_bytes);
    seed_world(&mut host_world, &mut rng);

    let mut replicas = Vec::with_capacity(options.clients);
    for i in 0..options.clients {
        let peer = PeerId(2 + i as u64);
        let mut session =
            ClientSession::new(net.endpoint(peer), config.clone(), manifest.clone(), now);
        session
            .connect(HOST_PEER)
            .with_context(|| format!("Failed to connect {}", peer))?;
        replicas.push(Replica {
            session,
            world: GridWorld::new(GridSize::new(1, 1)),
            last_state: ClientState::Connecting,
        });
    }

    let mut last_host_state = host.state();
    let mut playing_since = None;
    for tick in 0..options.ticks {
        now += TICK;
        let settling = tick + SETTLE_TICKS >= options.ticks;
        if playing_since.is_some() && !settling {
            mutate_world(&mut host_world, &mut rng);
        }

        let report = host.update(now, &mut host_world);
        if report.transfers_started > 0 {
            debug!("Tick {}: {} transfer(s) started", tick, report.transfers_started);
        }
        if host.state() != last_host_state {
            last_host_state = host.state();
            let detail = format!("{:?}", last_host_state);
            log_event(&mut events, tick, HOST_PEER, "host_state", &detail);
        }

        for replica in &mut replicas {
            replica.session.poll(now, &mut replica.world);
            let state = replica.session.state();
            if state != replica.last_state {
                replica.last_state = state;
                let peer = replica.session.local_peer();
                log_event(&mut events, tick, peer, "client_state", &format!("{:?}", state));
            }
            if state == ClientState::InGame && tick % CURSOR_EVERY == 0 {
                replica.session.send_cursor(32.0, 32.0, GRID.bounds());
            }
        }

        if playing_since.is_none()
            && !replicas.is_empty()
            && host.world_sync().is_seeded()
            && replicas
                .iter()
                .all(|r| r.session.state() == ClientState::InGame)
        {
            info!("Every client is in game after {} ticks", tick + 1);
            playing_since = Some(tick);
            log_event(&mut events, tick, HOST_PEER, "all_in_game", "");
        }
    }

    host.shutdown(now, "run finished");
    if host.state() != HostState::Stopped {
        warn!("Host did not stop cleanly");
    }

    let metrics = host.bulk().tracker().metrics().clone();
    let link = net.stats();
    let mut builder = RunReportBuilder::new("loopback")
        .ticks(options.ticks)
        .host(endpoint_metrics(HOST_PEER, format!("{:?}", last_host_state), host.stats()))
        .transfers(TransferSummary {
            started: metrics.started,
            completed: metrics.completed,
            resends: metrics.resends,
            reaped: metrics.reaped,
        })
        .link(LinkSummary {
            delivered: link.delivered,
            dropped: link.dropped,
            refused: link.refused,
        });
    for replica in &replicas {
        let mut entry = endpoint_metrics(
            replica.session.local_peer(),
            format!("{:?}", replica.last_state),
            replica.session.stats(),
        );
        entry.latency_ms = replica.session.latency_ms();
        entry.in_sync = Some(
            replica.last_state == ClientState::InGame && replica.world.same_contents(&host_world),
        );
        builder = builder.client(entry);
    }

    if let Some(sink) = events.as_mut() {
        sink.flush()?;
    }
    Ok(builder.build())
}
