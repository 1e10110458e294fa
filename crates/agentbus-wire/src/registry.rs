//! Peer registry: tracks linked peers, their channels and their links.
//!
//! The [`PeerRegistry`] is shared by every task of a TCP transport. It is the
//! single place that decides which link to a peer is authoritative when two
//! peers dial each other at the same time.

use crate::message::WireMessage;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Notify};

/// One established TCP link to a peer.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// Local id of the link, unique per transport.
    pub id: u64,
    /// Node id of the side that dialed.
    pub initiator: String,
    /// Queue drained by the link's writer task.
    pub tx: mpsc::UnboundedSender<WireMessage>,
    /// Wakes the link's reader task to close the link.
    pub close: Arc<Notify>,
}

impl PeerLink {
    /// Queue a frame. Returns false when the link is gone.
    pub fn send(&self, msg: WireMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// A single linked peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub node_id: String,
    pub node_name: String,
    /// Advertised `tcp://ip:port` of the peer's listener.
    pub endpoint: String,
    /// Socket address of the link.
    pub address: SocketAddr,
    pub headers: BTreeMap<String, String>,
    /// Channels the peer joined.
    pub channels: HashSet<String>,
    /// Hex public key when the link is authenticated.
    pub public_key: Option<String>,
    pub protocol_version: u32,
    pub connected_at: DateTime<Utc>,
    /// Last frame received from the peer.
    pub last_seen: DateTime<Utc>,
    pub link: PeerLink,
}

/// Result of [`PeerRegistry::insert_link`].
#[derive(Debug)]
pub enum LinkOutcome {
    /// First link to this peer.
    New,
    /// The new link supersedes an existing one, which the caller must close.
    Replaced(PeerLink),
    /// An authoritative link already exists. The new one must be closed.
    Rejected,
}

/// Thread-safe registry of all linked peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a link after a successful handshake.
    ///
    /// When both sides dial each other, the link initiated by the lower node
    /// id wins on both ends, so both peers keep the same link.
    pub fn insert_link(&self, entry: PeerEntry, local_id: &str) -> LinkOutcome {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let Some(existing) = peers.get(&entry.node_id) else {
            peers.insert(entry.node_id.clone(), entry);
            return LinkOutcome::New;
        };
        let preferred = std::cmp::min(local_id, entry.node_id.as_str());
        if entry.link.initiator == preferred && existing.link.initiator != preferred {
            let old = existing.link.clone();
            peers.insert(entry.node_id.clone(), entry);
            LinkOutcome::Replaced(old)
        } else {
            LinkOutcome::Rejected
        }
    }

    /// Remove a peer if `link_id` is still its current link.
    pub fn remove_link(&self, node_id: &str, link_id: u64) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.get(node_id).map(|p| p.link.id) == Some(link_id) {
            peers.remove(node_id)
        } else {
            None
        }
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, node_id: &str) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(node_id)
    }

    /// Remove every peer, returning them.
    pub fn drain(&self) -> Vec<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.drain().map(|(_, p)| p).collect()
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, node_id: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(node_id)
    }

    /// Whether any linked peer advertises `endpoint`.
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().any(|p| p.endpoint == endpoint)
    }

    /// Get all peers.
    pub fn all_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Links of the peers subscribed to `channel`.
    pub fn subscribers(&self, channel: &str) -> Vec<PeerLink> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.channels.contains(channel))
            .map(|p| p.link.clone())
            .collect()
    }

    pub fn links(&self) -> Vec<PeerLink> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().map(|p| p.link.clone()).collect()
    }

    pub fn link(&self, node_id: &str) -> Option<PeerLink> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).map(|p| p.link.clone())
    }

    /// Record that a peer joined a channel.
    pub fn join(&self, node_id: &str, channel: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node_id) {
            entry.channels.insert(channel.to_string());
        }
    }

    /// Record that a peer left a channel.
    pub fn leave(&self, node_id: &str, channel: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node_id) {
            entry.channels.remove(channel);
        }
    }

    /// Refresh a peer's liveness.
    pub fn touch(&self, node_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Number of linked peers.
    pub fn count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(node_id: &str, initiator: &str, link_id: u64) -> PeerEntry {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerEntry {
            node_id: node_id.to_string(),
            node_name: format!("{node_id}-name"),
            endpoint: format!("tcp://127.0.0.1:{}", 9000 + link_id),
            address: "127.0.0.1:9000".parse().unwrap(),
            headers: BTreeMap::new(),
            channels: HashSet::new(),
            public_key: None,
            protocol_version: 1,
            connected_at: Utc::now(),
            last_seen: Utc::now(),
            link: PeerLink {
                id: link_id,
                initiator: initiator.to_string(),
                tx,
                close: Arc::new(Notify::new()),
            },
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = PeerRegistry::new();
        assert!(matches!(
            registry.insert_link(make_peer("b", "a", 1), "a"),
            LinkOutcome::New
        ));
        assert!(registry.contains("b"));
        assert!(registry.remove_link("b", 99).is_none());
        assert!(registry.remove_link("b", 1).is_some());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_duplicate_link_lower_initiator_wins() {
        // Seen from node "b": we dialed "a", then "a" dialed us. "a" < "b".
        let registry = PeerRegistry::new();
        registry.insert_link(make_peer("a", "b", 1), "b");
        match registry.insert_link(make_peer("a", "a", 2), "b") {
            LinkOutcome::Replaced(old) => assert_eq!(old.id, 1),
            other => panic!("Expected Replaced, got {other:?}"),
        }
        assert_eq!(registry.get_peer("a").unwrap().link.id, 2);
        // The link dialed by the higher id never replaces.
        assert!(matches!(
            registry.insert_link(make_peer("a", "b", 3), "b"),
            LinkOutcome::Rejected
        ));
    }

    #[test]
    fn test_channels() {
        let registry = PeerRegistry::new();
        registry.insert_link(make_peer("b", "a", 1), "a");
        registry.insert_link(make_peer("c", "a", 2), "a");
        registry.join("b", "chat");
        assert_eq!(registry.subscribers("chat").len(), 1);
        registry.join("c", "chat");
        registry.leave("b", "chat");
        let subs = registry.subscribers("chat");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, 2);
    }

    #[test]
    fn test_has_endpoint() {
        let registry = PeerRegistry::new();
        registry.insert_link(make_peer("b", "a", 1), "a");
        assert!(registry.has_endpoint("tcp://127.0.0.1:9001"));
        assert!(!registry.has_endpoint("tcp://127.0.0.1:1"));
    }
}
