//! In-memory transport linking any number of endpoints in one process.
//!
//! Every [`LoopbackTransport`] created from the same [`LoopbackNetwork`]
//! shares one hub. Sends are delivered immediately into the remote inbox, in
//! order. Faults are injected at the hub: dropping every Kth packet of a
//! given kind, refusing sends once an inbox holds too many messages, and
//! severing every connection of a peer.

use colonysync_core::PeerId;
use colonysync_net::{
    ConnectionHandle, InboundMessage, PacketType, SendMode, Transport, TransportError,
    TransportEvent,
};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use tracing::trace;

/// Delivery counters for the whole hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Messages placed in a remote inbox.
    pub delivered: u64,
    /// Messages discarded by fault injection.
    pub dropped: u64,
    /// Sends refused because the remote inbox was full.
    pub refused: u64,
}

#[derive(Debug, Clone, Copy)]
struct End {
    owner: PeerId,
    remote: PeerId,
    remote_conn: ConnectionHandle,
    open: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    events: VecDeque<TransportEvent>,
    inbox: VecDeque<InboundMessage>,
}

#[derive(Debug, Clone, Copy)]
struct DropRule {
    every: u64,
    tag: Option<u8>,
    seen: u64,
}

#[derive(Debug, Default)]
struct Hub {
    next_handle: u32,
    listening: BTreeSet<PeerId>,
    ends: HashMap<ConnectionHandle, End>,
    mailboxes: HashMap<PeerId, Mailbox>,
    drop_rule: Option<DropRule>,
    capacity: Option<usize>,
    stats: LinkStats,
}

impl Hub {
    fn mailbox(&mut self, peer: PeerId) -> &mut Mailbox {
        self.mailboxes.entry(peer).or_default()
    }

    fn allocate(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle(self.next_handle)
    }

    fn owned(&self, local: PeerId, conn: ConnectionHandle) -> Option<End> {
        self.ends.get(&conn).copied().filter(|end| end.owner == local)
    }

    fn close_pair(&mut self, conn: ConnectionHandle, reason: &str) {
        let Some(end) = self.ends.remove(&conn) else {
            return;
        };
        self.ends.remove(&end.remote_conn);
        self.mailbox(end.owner).events.push_back(TransportEvent::Closed {
            conn,
            peer: end.remote,
            reason: reason.to_string(),
        });
        self.mailbox(end.remote).events.push_back(TransportEvent::Closed {
            conn: end.remote_conn,
            peer: end.owner,
            reason: reason.to_string(),
        });
    }

    fn should_drop(&mut self, bytes: &[u8]) -> bool {
        let Some(rule) = self.drop_rule.as_mut() else {
            return false;
        };
        if let Some(tag) = rule.tag {
            if bytes.first() != Some(&tag) {
                return false;
            }
        }
        rule.seen += 1;
        rule.seen % rule.every == 0
    }
}

/// Shared in-memory network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl LoopbackNetwork {
    /// Empty network without faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport endpoint identified as `peer`.
    pub fn endpoint(&self, peer: PeerId) -> LoopbackTransport {
        self.hub.borrow_mut().mailbox(peer);
        LoopbackTransport {
            hub: Rc::clone(&self.hub),
            local: peer,
        }
    }

    /// True if `peer` is accepting connections.
    pub fn is_listening(&self, peer: PeerId) -> bool {
        self.hub.borrow().listening.contains(&peer)
    }

    /// Drop every `k`th packet, optionally only packets of one kind.
    ///
    /// `k == 0` turns dropping off.
    pub fn drop_every(&self, k: u64, kind: Option<PacketType>) {
        self.hub.borrow_mut().drop_rule = (k > 0).then_some(DropRule {
            every: k,
            tag: kind.map(PacketType::as_u8),
            seen: 0,
        });
    }

    /// Refuse sends once the remote inbox holds `capacity` messages.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.hub.borrow_mut().capacity = capacity;
    }

    /// Close every connection touching `peer`, as a network failure would.
    pub fn sever(&self, peer: PeerId) -> usize {
        let mut hub = self.hub.borrow_mut();
        let conns: Vec<ConnectionHandle> = hub
            .ends
            .iter()
            .filter(|(_, end)| end.owner == peer)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in &conns {
            hub.close_pair(*conn, "link severed");
        }
        conns.len()
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> LinkStats {
        self.hub.borrow().stats
    }
}

/// One endpoint of a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: Rc<RefCell<Hub>>,
    local: PeerId,
}

impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn listen(&mut self) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        if !hub.listening.insert(self.local) {
            return Err(TransportError::ListenFailed(format!(
                "{} is already listening",
                self.local
            )));
        }
        Ok(())
    }

    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, TransportError> {
        let mut hub = self.hub.borrow_mut();
        if !hub.listening.contains(&peer) {
            return Err(TransportError::ConnectFailed {
                peer,
                reason: "no listener".to_string(),
            });
        }
        let local_conn = hub.allocate();
        let remote_conn = hub.allocate();
        hub.ends.insert(
            local_conn,
            End {
                owner: self.local,
                remote: peer,
                remote_conn,
                open: false,
            },
        );
        hub.ends.insert(
            remote_conn,
            End {
                owner: peer,
                remote: self.local,
                remote_conn: local_conn,
                open: false,
            },
        );
        hub.mailbox(peer).events.push_back(TransportEvent::Incoming {
            conn: remote_conn,
            peer: self.local,
        });
        Ok(local_conn)
    }

    fn accept(&mut self, conn: ConnectionHandle) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let end = hub
            .owned(self.local, conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        for handle in [conn, end.remote_conn] {
            if let Some(e) = hub.ends.get_mut(&handle) {
                e.open = true;
            }
        }
        hub.mailbox(self.local).events.push_back(TransportEvent::Connected {
            conn,
            peer: end.remote,
        });
        hub.mailbox(end.remote).events.push_back(TransportEvent::Connected {
            conn: end.remote_conn,
            peer: self.local,
        });
        Ok(())
    }

    fn close(&mut self, conn: ConnectionHandle, reason: &str) {
        let mut hub = self.hub.borrow_mut();
        if hub.owned(self.local, conn).is_some() {
            hub.close_pair(conn, reason);
        }
    }

    fn send(
        &mut self,
        conn: ConnectionHandle,
        bytes: &[u8],
        mode: SendMode,
    ) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let end = hub
            .owned(self.local, conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        if !end.open {
            return Err(TransportError::Closed(conn));
        }
        if let Some(capacity) = hub.capacity {
            if hub.mailbox(end.remote).inbox.len() >= capacity {
                hub.stats.refused += 1;
                return Err(TransportError::QueueFull(conn));
            }
        }
        if hub.should_drop(bytes) {
            trace!("Dropping {} byte(s) on {} ({:?})", bytes.len(), conn, mode);
            hub.stats.dropped += 1;
            return Ok(());
        }
        hub.mailbox(end.remote).inbox.push_back(InboundMessage {
            conn: end.remote_conn,
            bytes: bytes.to_vec(),
        });
        hub.stats.delivered += 1;
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.hub
            .borrow_mut()
            .mailbox(self.local)
            .events
            .drain(..)
            .collect()
    }

    fn receive(&mut self, max: usize) -> Vec<InboundMessage> {
        let mut hub = self.hub.borrow_mut();
        let inbox = &mut hub.mailbox(self.local).inbox;
        let take = max.min(inbox.len());
        inbox.drain(..take).collect()
    }

    fn peer_of(&self, conn: ConnectionHandle) -> Option<PeerId> {
        self.hub
            .borrow()
            .owned(self.local, conn)
            .map(|end| end.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: PeerId = PeerId(1);
    const GUEST: PeerId = PeerId(2);

    fn linked(
        net: &LoopbackNetwork,
    ) -> (
        LoopbackTransport,
        LoopbackTransport,
        ConnectionHandle,
        ConnectionHandle,
    ) {
        let mut host = net.endpoint(HOST);
        let mut guest = net.endpoint(GUEST);
        host.listen().expect("listen");
        let guest_conn = guest.connect(HOST).expect("connect");
        let host_conn = match host.poll_events().as_slice() {
            [TransportEvent::Incoming { conn, peer }] if *peer == GUEST => *conn,
            other => panic!("unexpected events {:?}", other),
        };
        host.accept(host_conn).expect("accept");
        (host, guest, host_conn, guest_conn)
    }

    #[test]
    fn test_connect_requires_listener() {
        let net = LoopbackNetwork::new();
        let mut guest = net.endpoint(GUEST);
        assert!(matches!(
            guest.connect(HOST),
            Err(TransportError::ConnectFailed { .. })
        ));

        let mut host = net.endpoint(HOST);
        host.listen().expect("listen");
        assert!(net.is_listening(HOST));
        assert!(net.endpoint(HOST).listen().is_err());
    }

    #[test]
    fn test_accept_connects_both_sides_and_delivers_in_order() {
        let net = LoopbackNetwork::new();
        let (mut host, mut guest, host_conn, guest_conn) = linked(&net);

        assert_eq!(
            guest.poll_events(),
            vec![TransportEvent::Connected {
                conn: guest_conn,
                peer: HOST
            }]
        );
        assert_eq!(host.peer_of(host_conn), Some(GUEST));
        assert_eq!(guest.peer_of(host_conn), None);

        guest.send(guest_conn, b"one", SendMode::Reliable).expect("send");
        guest.send(guest_conn, b"two", SendMode::Unreliable).expect("send");
        let got = host.receive(10);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].bytes, b"one");
        assert_eq!(got[1].conn, host_conn);
        assert_eq!(net.stats().delivered, 2);
    }

    #[test]
    fn test_send_before_accept_is_refused() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        host.listen().expect("listen");
        let mut guest = net.endpoint(GUEST);
        let conn = guest.connect(HOST).expect("connect");
        assert_eq!(
            guest.send(conn, b"x", SendMode::Reliable),
            Err(TransportError::Closed(conn))
        );
    }

    #[test]
    fn test_drop_every_kth_matching_packet() {
        let net = LoopbackNetwork::new();
        let (mut host, mut guest, _, guest_conn) = linked(&net);
        net.drop_every(3, Some(PacketType::ChunkAck));

        let ack = PacketType::ChunkAck.as_u8();
        let ping = PacketType::Ping.as_u8();
        for _ in 0..6 {
            guest.send(guest_conn, &[ack], SendMode::Reliable).expect("send");
            guest.send(guest_conn, &[ping], SendMode::Reliable).expect("send");
        }
        let got = host.receive(usize::MAX);
        assert_eq!(got.iter().filter(|m| m.bytes[0] == ack).count(), 4);
        assert_eq!(got.iter().filter(|m| m.bytes[0] == ping).count(), 6);
        assert_eq!(net.stats().dropped, 2);
    }

    #[test]
    fn test_full_inbox_refuses_sends() {
        let net = LoopbackNetwork::new();
        let (mut host, _guest, host_conn, _) = linked(&net);
        net.set_capacity(Some(1));

        host.send(host_conn, b"a", SendMode::Reliable).expect("first fits");
        assert_eq!(
            host.send(host_conn, b"b", SendMode::Reliable),
            Err(TransportError::QueueFull(host_conn))
        );
        assert_eq!(net.stats().refused, 1);
    }

    #[test]
    fn test_sever_closes_both_ends() {
        let net = LoopbackNetwork::new();
        let (mut host, mut guest, host_conn, guest_conn) = linked(&net);
        guest.poll_events();
        host.poll_events();

        assert_eq!(net.sever(GUEST), 1);
        assert!(matches!(
            host.poll_events().as_slice(),
            [TransportEvent::Closed { conn, peer, .. }] if *conn == host_conn && *peer == GUEST
        ));
        assert!(matches!(
            guest.poll_events().as_slice(),
            [TransportEvent::Closed { conn, .. }] if *conn == guest_conn
        ));
        assert!(host.send(host_conn, b"x", SendMode::Reliable).is_err());
    }
}
