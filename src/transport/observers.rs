//! Observer registry: operator connections that receive angle broadcasts
//!
//! Membership is added on connect and removed on the observer's own close
//! event. Broadcast is fan-out and best-effort: a send to a dead observer
//! is tolerated and the connection is reaped later, never synchronously.

use crate::transport::{PeerHandle, PeerId};
use std::collections::HashMap;

/// Unordered set of live operator connections
#[derive(Default)]
pub struct ObserverRegistry {
    peers: HashMap<PeerId, PeerHandle>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected observer
    pub fn insert(&mut self, handle: PeerHandle) {
        log::debug!("Observer {} registered ({})", handle.id, handle.addr);
        self.peers.insert(handle.id, handle);
    }

    /// Remove an observer after its connection closed
    pub fn remove(&mut self, id: PeerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send a line to every observer, best-effort
    pub fn broadcast(&self, line: &str) {
        for handle in self.peers.values() {
            if !handle.send_line(line) {
                // Dead writer; the Closed event will reap this peer
                log::trace!("Observer {} unreachable, skipping", handle.id);
            }
        }
    }
}
