//! Injected message transport.
//!
//! The engine never talks to sockets directly. A [`Transport`] offers
//! unreliable and reliable-ordered sends to a connection handle, lifecycle
//! events, and a polled receive batch. Everything runs on the caller's tick.

use colonysync_core::PeerId;
use std::fmt;
use thiserror::Error;

/// Opaque per-connection handle issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Delivery guarantee requested for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// May be dropped or reordered.
    Unreliable,
    /// Delivered in send order on this connection.
    Reliable,
}

impl SendMode {
    /// True for [`SendMode::Reliable`].
    pub fn is_reliable(&self) -> bool {
        matches!(self, SendMode::Reliable)
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer is knocking; the host decides whether to [`Transport::accept`].
    Incoming {
        /// Handle for the pending connection.
        conn: ConnectionHandle,
        /// Remote identity.
        peer: PeerId,
    },
    /// The connection is open in both directions.
    Connected {
        /// Open connection.
        conn: ConnectionHandle,
        /// Remote identity.
        peer: PeerId,
    },
    /// The connection closed or failed.
    Closed {
        /// Closed connection.
        conn: ConnectionHandle,
        /// Remote identity, if it was known.
        peer: PeerId,
        /// Transport-supplied reason.
        reason: String,
    },
}

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Connection it arrived on.
    pub conn: ConnectionHandle,
    /// Raw packet bytes.
    pub bytes: Vec<u8>,
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not open a listen socket / poll group.
    #[error("failed to listen: {0}")]
    ListenFailed(String),
    /// Could not start an outbound connection.
    #[error("failed to connect to {peer}: {reason}")]
    ConnectFailed {
        /// Target peer.
        peer: PeerId,
        /// Transport-supplied reason.
        reason: String,
    },
    /// The handle does not name a live connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionHandle),
    /// No open connection to the peer.
    #[error("{0} is not connected")]
    NotConnected(PeerId),
    /// The connection has closed.
    #[error("connection {0} is closed")]
    Closed(ConnectionHandle),
    /// The send queue is full; retry later.
    #[error("send queue full on {0}")]
    QueueFull(ConnectionHandle),
}

/// Message-oriented transport capability.
pub trait Transport {
    /// Identity of this endpoint.
    fn local_peer(&self) -> PeerId;

    /// Start accepting inbound connections.
    fn listen(&mut self) -> Result<(), TransportError>;

    /// Begin connecting to `peer`. Completion arrives as [`TransportEvent::Connected`].
    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, TransportError>;

    /// Accept a connection announced by [`TransportEvent::Incoming`].
    fn accept(&mut self, conn: ConnectionHandle) -> Result<(), TransportError>;

    /// Close a connection. Unknown handles are ignored.
    fn close(&mut self, conn: ConnectionHandle, reason: &str);

    /// Queue `bytes` for delivery.
    fn send(
        &mut self,
        conn: ConnectionHandle,
        bytes: &[u8],
        mode: SendMode,
    ) -> Result<(), TransportError>;

    /// Drain pending lifecycle events.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Drain at most `max` received messages.
    fn receive(&mut self, max: usize) -> Vec<InboundMessage>;

    /// Resolve a handle to the remote identity.
    fn peer_of(&self, conn: ConnectionHandle) -> Option<PeerId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_mode_reliability() {
        assert!(SendMode::Reliable.is_reliable());
        assert!(!SendMode::Unreliable.is_reliable());
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::QueueFull(ConnectionHandle(3));
        assert_eq!(err.to_string(), "send queue full on conn:3");
        let err = TransportError::ConnectFailed {
            peer: PeerId(9),
            reason: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "failed to connect to peer:9: refused");
    }
}
