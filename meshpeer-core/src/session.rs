//! Session membership: which peers are connected right now.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdentity};

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    /// Transport-internal; absorbed by the core.
    Connecting,
    Connected,
}

/// Change to surface to the application after applying a transport state report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Connected(PeerIdentity),
    /// `was_member` is false when the peer was never in the set (removal was a no-op).
    Disconnected { peer: PeerIdentity, was_member: bool },
}

/// Connected set. A peer not in the set is `NotConnected`.
#[derive(Debug, Default)]
pub struct SessionState {
    connected: HashMap<PeerId, PeerIdentity>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transport-reported state. `Connecting` yields `None`.
    pub fn apply(&mut self, peer: PeerIdentity, state: ConnectionState) -> Option<SessionChange> {
        match state {
            ConnectionState::Connected => {
                self.connected.insert(peer.id(), peer.clone());
                Some(SessionChange::Connected(peer))
            }
            ConnectionState::NotConnected => {
                let was_member = self.connected.remove(&peer.id()).is_some();
                Some(SessionChange::Disconnected { peer, was_member })
            }
            ConnectionState::Connecting => None,
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains_key(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        if self.is_connected(peer) {
            ConnectionState::Connected
        } else {
            ConnectionState::NotConnected
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerIdentity> {
        self.connected.get(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.connected.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}
