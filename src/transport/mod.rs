//! Transport layer: per-connection tasks, downlink dispatch, and the
//! observer registry
//!
//! Every accepted connection gets a reader thread and a writer thread.
//! Readers translate socket traffic into typed [`RouterEvent`]s on a
//! single channel consumed by the router thread; writers drain a
//! per-connection outbound queue. The router never touches a socket
//! directly except through these capabilities.

pub mod connection;
pub mod downlink;
pub mod observers;

pub use connection::{spawn_connection, ORIGIN_MARKER};
pub use downlink::Downlink;
pub use observers::ObserverRegistry;

use crossbeam_channel::Sender;
use std::net::SocketAddr;

/// Monotonically assigned identifier for a connection
pub type PeerId = u64;

/// Role of a bidirectional connection, classified once at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Browser-based operator: sends setpoints, receives angle broadcasts
    Operator,
    /// Actuator controller: sends credentials and feedback, receives
    /// commands
    Controller,
}

/// Instruction for a connection's writer thread
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write one line to the peer
    Line(String),
    /// Shut the socket down, ending the connection
    Shutdown,
}

/// Send capability for one connected peer
#[derive(Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub role: Role,
    sender: Sender<Outbound>,
}

impl PeerHandle {
    pub fn new(id: PeerId, addr: SocketAddr, role: Role, sender: Sender<Outbound>) -> Self {
        Self {
            id,
            addr,
            role,
            sender,
        }
    }

    /// Best-effort line send; a dead writer is tolerated and the peer is
    /// reaped later on its own close event
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        self.sender.send(Outbound::Line(line.into())).is_ok()
    }

    /// Ask the writer thread to shut the connection down
    pub fn shutdown(&self) {
        let _ = self.sender.send(Outbound::Shutdown);
    }
}

/// Typed events consumed by the router thread
#[derive(Clone)]
pub enum RouterEvent {
    /// A connection completed role classification
    Connected(PeerHandle),
    /// One inbound message line from a peer
    Message { peer: PeerId, text: String },
    /// The connection closed or dropped
    Closed(PeerId),
    /// The post-reset settling delay elapsed
    SettleExpired { generation: u64 },
}
