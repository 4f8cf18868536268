//! Decode-and-react loop.
//!
//! Each inbound buffer is decoded through the [`PacketRegistry`] and handed to
//! a role-specific [`PacketHandler`]. Plugin packets run their own reaction
//! instead. A malformed buffer or a failing handler is logged and dropped; the
//! rest of the batch still runs.

use crate::protocol::{Packet, PacketType};
use crate::registry::PacketRegistry;
use crate::transport::SendMode;
use crate::wire::WireError;
use colonysync_core::{AuthoritativeWorld, PeerId, ReplicaWorld};
use std::time::Instant;
use tracing::{trace, warn};

/// Where an outgoing packet goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// One peer. On a client this is always the host.
    Peer(PeerId),
    /// Every connected peer.
    Broadcast,
    /// Every connected peer but one (relay/forward).
    BroadcastExcept(PeerId),
}

/// A queued outgoing packet.
#[derive(Debug, PartialEq)]
pub struct Envelope {
    /// Target.
    pub to: Destination,
    /// Packet to encode.
    pub packet: Packet,
    /// Delivery guarantee.
    pub mode: SendMode,
}

/// Packets produced while handling a batch, flushed by the session afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Envelope>,
}

impl Outbox {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `packet` for `peer` using its default mode.
    pub fn send_to(&mut self, peer: PeerId, packet: Packet) {
        let mode = packet.default_send_mode();
        self.push(Destination::Peer(peer), packet, mode);
    }

    /// Queue `packet` for every peer using its default mode.
    pub fn broadcast(&mut self, packet: Packet) {
        let mode = packet.default_send_mode();
        self.push(Destination::Broadcast, packet, mode);
    }

    /// Queue `packet` for every peer except `skip`.
    pub fn broadcast_except(&mut self, skip: PeerId, packet: Packet) {
        let mode = packet.default_send_mode();
        self.push(Destination::BroadcastExcept(skip), packet, mode);
    }

    /// Queue with an explicit destination and mode.
    pub fn push(&mut self, to: Destination, packet: Packet, mode: SendMode) {
        self.queue.push(Envelope { to, packet, mode });
    }

    /// Take everything queued so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.queue)
    }

    /// Queued envelopes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Borrow the queue.
    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }
}

/// Simulation state handed to a plugin reaction.
pub enum WorldAccess<'a> {
    /// The host's authoritative world.
    Authoritative(&'a dyn AuthoritativeWorld),
    /// The client's local replica.
    Replica(&'a mut dyn ReplicaWorld),
    /// No world is attached.
    Detached,
}

impl<'a> WorldAccess<'a> {
    /// The replica, when running on a client.
    pub fn replica(&mut self) -> Option<&mut (dyn ReplicaWorld + 'a)> {
        match self {
            WorldAccess::Replica(world) => Some(&mut **world),
            _ => None,
        }
    }

    /// The authoritative world, when running on the host.
    pub fn authoritative(&self) -> Option<&'a dyn AuthoritativeWorld> {
        match self {
            WorldAccess::Authoritative(world) => Some(*world),
            _ => None,
        }
    }
}

/// What a plugin reaction can see and do.
pub struct PluginContext<'a> {
    /// Sending peer.
    pub from: PeerId,
    /// Reply channel.
    pub outbox: &'a mut Outbox,
    /// Tick time.
    pub now: Instant,
    /// Local simulation state.
    pub world: WorldAccess<'a>,
}

/// Role-specific reaction to core packets.
pub trait PacketHandler {
    /// React to one decoded packet from `from`.
    fn handle_packet(
        &mut self,
        from: PeerId,
        packet: Packet,
        outbox: &mut Outbox,
        now: Instant,
    ) -> anyhow::Result<()>;

    /// World exposed to plugin reactions.
    fn world_access(&mut self) -> WorldAccess<'_> {
        WorldAccess::Detached
    }
}

/// Result of dispatching one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and handled.
    Handled(PacketType),
    /// Could not be decoded; dropped.
    Dropped(WireError),
    /// Decoded, but the reaction failed.
    Failed(PacketType),
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Buffers handled successfully.
    pub handled: u64,
    /// Buffers that failed to decode.
    pub dropped: u64,
    /// Reactions that returned an error.
    pub failed: u64,
}

/// Decodes buffers and routes them to reactions.
#[derive(Debug, Default)]
pub struct Dispatcher {
    registry: PacketRegistry,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Dispatcher over `registry`.
    pub fn new(registry: PacketRegistry) -> Self {
        Self {
            registry,
            stats: DispatchStats::default(),
        }
    }

    /// The factory table.
    pub fn registry(&self) -> &PacketRegistry {
        &self.registry
    }

    /// Mutable factory table, for late plugin registration.
    pub fn registry_mut(&mut self) -> &mut PacketRegistry {
        &mut self.registry
    }

    /// Counters so far.
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Decode `bytes` and run its reaction.
    pub fn dispatch<H: PacketHandler + ?Sized>(
        &mut self,
        from: PeerId,
        bytes: &[u8],
        handler: &mut H,
        outbox: &mut Outbox,
        now: Instant,
    ) -> DispatchOutcome {
        let packet = match self.registry.decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet from {} ({} bytes): {}", from, bytes.len(), e);
                self.stats.dropped += 1;
                return DispatchOutcome::Dropped(e);
            }
        };

        let kind = packet.packet_type();
        trace!("Dispatching {:?} from {}", kind, from);

        let result = match packet {
            Packet::Plugin(mut plugin) => {
                let mut ctx = PluginContext {
                    from,
                    outbox,
                    now,
                    world: handler.world_access(),
                };
                plugin.payload_mut().on_dispatched(&mut ctx)
            }
            packet => handler.handle_packet(from, packet, outbox, now),
        };

        match result {
            Ok(()) => {
                self.stats.handled += 1;
                DispatchOutcome::Handled(kind)
            }
            Err(e) => {
                warn!("Handler for {:?} from {} failed: {:#}", kind, from, e);
                self.stats.failed += 1;
                DispatchOutcome::Failed(kind)
            }
        }
    }
}
