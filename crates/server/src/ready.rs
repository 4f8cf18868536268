//! Ready-state bookkeeping across connected peers.

use crate::connection::ConnectionTable;
use colonysync_net::protocol::ReadyStatusUpdate;
use colonysync_net::{Packet, ReadyState};

/// Ready count over peers that may receive the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadySummary {
    /// Peers reporting [`ReadyState::Ready`].
    pub ready: usize,
    /// Peers counted.
    pub total: usize,
}

impl ReadySummary {
    /// Count the table.
    pub fn of(table: &ConnectionTable) -> Self {
        let mut summary = Self::default();
        for record in table.iter().filter(|r| r.can_receive_world()) {
            summary.total += 1;
            if record.ready() == ReadyState::Ready {
                summary.ready += 1;
            }
        }
        summary
    }

    /// Every counted peer is ready (and there is at least one).
    pub fn all_ready(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }

    /// Packet announcing this summary.
    pub fn to_packet(self) -> Packet {
        if self.all_ready() {
            Packet::AllClientsReady
        } else {
            Packet::ReadyStatusUpdate(ReadyStatusUpdate {
                ready: self.ready as i32,
                total: self.total as i32,
            })
        }
    }
}

/// Reset every peer to unready, ahead of a hard sync.
pub fn mark_all_unready(table: &mut ConnectionTable) -> usize {
    let mut changed = 0;
    for record in table.iter_mut() {
        if record.ready() != ReadyState::Unready {
            record.set_ready(ReadyState::Unready);
            changed += 1;
        }
    }
    changed
}
