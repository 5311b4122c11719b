//! Discovery registry: push-driven cache of currently visible peers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::{PeerId, PeerIdentity};

/// Key-value metadata a peer advertises alongside its identity.
pub type DiscoveryInfo = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub identity: PeerIdentity,
    pub info: Option<DiscoveryInfo>,
    pub last_seen: Instant,
}

/// Visible peers keyed by id. Records only what the transport reported; cannot fail.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    entries: HashMap<PeerId, DiscoveryEntry>,
    staleness: Option<Duration>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also expires entries not refreshed within `window`.
    pub fn with_staleness(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            staleness: Some(window),
        }
    }

    /// Insert or refresh. Latest metadata wins.
    pub fn on_found(&mut self, identity: PeerIdentity, info: Option<DiscoveryInfo>, now: Instant) {
        self.entries.insert(
            identity.id(),
            DiscoveryEntry {
                identity,
                info,
                last_seen: now,
            },
        );
    }

    /// Remove the entry if present. Unknown peers are not an error.
    pub fn on_lost(&mut self, peer: &PeerId) -> Option<DiscoveryEntry> {
        self.entries.remove(peer)
    }

    /// Remove and return entries older than the staleness window. No-op without a window.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<DiscoveryEntry> {
        let Some(window) = self.staleness else {
            return Vec::new();
        };
        let stale: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > window)
            .map(|(&id, _)| id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn visible(&self) -> Vec<PeerIdentity> {
        self.entries.values().map(|e| e.identity.clone()).collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&DiscoveryEntry> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
