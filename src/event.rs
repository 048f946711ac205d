//! Outputs of the connector.

use std::net::SocketAddr;

use crate::message::{AlertDescription, SessionId};

/// Something the caller has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Send `datagram` to `peer`.
    Transmit { peer: SocketAddr, datagram: Vec<u8> },
    /// A handshake with `peer` completed.
    Connected {
        peer: SocketAddr,
        session_id: SessionId,
        resumed: bool,
    },
    /// Application data received from `peer`.
    ApplicationData { peer: SocketAddr, data: Vec<u8> },
    /// Deferred application data was dropped to make room for newer data.
    DeferredDropped { peer: SocketAddr, data: Vec<u8> },
    /// The connection to `peer` is gone.
    Closed { peer: SocketAddr, reason: CloseReason },
}

impl Output {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Output::Transmit { peer, .. }
            | Output::Connected { peer, .. }
            | Output::ApplicationData { peer, .. }
            | Output::DeferredDropped { peer, .. }
            | Output::Closed { peer, .. } => *peer,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent close_notify.
    PeerClosed,
    /// The peer sent a fatal alert.
    PeerAlert(AlertDescription),
    /// We aborted the handshake and sent this alert.
    HandshakeFailed(AlertDescription),
    /// The peer never answered our flight.
    RetransmissionsExhausted,
    /// Closed through [`Connector::close`](crate::Connector::close).
    LocalClose,
    /// Evicted from a full store, or replaced by a new handshake.
    Evicted,
}
