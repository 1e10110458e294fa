//! Heartbeat checks: detect peers that went silent.
//!
//! Every linked peer is pinged periodically; any frame refreshes its
//! `last_seen`. A peer silent for longer than the timeout is expired by the
//! transport as if it had disconnected.

use crate::registry::PeerRegistry;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default ping interval.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default silence after which a peer expires.
const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a heartbeat check.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    pub node_id: String,
    pub node_name: String,
    /// Milliseconds since the last frame.
    pub silent_ms: i64,
    pub unresponsive: bool,
}

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to ping peers and check for expiry.
    pub check_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

/// Check all linked peers.
///
/// This is a pure function; the transport's heartbeat task calls it.
pub fn check_peers(registry: &PeerRegistry, config: &HeartbeatConfig) -> Vec<HeartbeatStatus> {
    let now = Utc::now();
    let timeout_ms = config.peer_timeout.as_millis() as i64;

    registry
        .all_peers()
        .into_iter()
        .map(|peer| {
            let silent_ms = (now - peer.last_seen).num_milliseconds();
            let unresponsive = silent_ms > timeout_ms;
            if unresponsive {
                warn!(peer = %peer.node_id, name = %peer.node_name, silent_ms, "Peer is unresponsive");
            } else {
                debug!(peer = %peer.node_id, silent_ms, "Peer heartbeat OK");
            }
            HeartbeatStatus {
                node_id: peer.node_id,
                node_name: peer.node_name,
                silent_ms,
                unresponsive,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerEntry, PeerLink};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};

    fn peer(node_id: &str, silent: chrono::Duration) -> PeerEntry {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerEntry {
            node_id: node_id.to_string(),
            node_name: node_id.to_string(),
            endpoint: String::new(),
            address: "127.0.0.1:1".parse().unwrap(),
            headers: BTreeMap::new(),
            channels: HashSet::new(),
            public_key: None,
            protocol_version: 1,
            connected_at: Utc::now(),
            last_seen: Utc::now() - silent,
            link: PeerLink {
                id: 1,
                initiator: node_id.to_string(),
                tx,
                close: Arc::new(Notify::new()),
            },
        }
    }

    #[test]
    fn test_heartbeat_config_default() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(1));
        assert_eq!(config.peer_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_check_peers_flags_silent_ones() {
        let registry = PeerRegistry::new();
        registry.insert_link(peer("fresh", chrono::Duration::zero()), "z");
        registry.insert_link(peer("stale", chrono::Duration::seconds(60)), "z");

        let statuses = check_peers(&registry, &HeartbeatConfig::default());
        assert_eq!(statuses.len(), 2);
        let stale: Vec<_> = statuses.iter().filter(|s| s.unresponsive).collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].node_id, "stale");
    }

    #[test]
    fn test_check_empty_registry() {
        assert!(check_peers(&PeerRegistry::new(), &HeartbeatConfig::default()).is_empty());
    }
}
