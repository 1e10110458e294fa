//! In-process transport.
//!
//! A [`LoopbackHub`] connects any number of transports living in the same
//! process. It follows the same contract as the TCP transport (no delivery
//! to self, channel subscription, enter/exit events in both directions) and
//! is what tests and single-process deployments use.

use crate::transport::{PeerInfo, Transport, TransportEvent, WireError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

struct Node {
    info: PeerInfo,
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

/// A shared in-process network. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("LoopbackHub")
            .field("nodes", &nodes.len())
            .finish()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node. Existing nodes and the new one learn about each other.
    pub fn connect(
        &self,
        name: &str,
        headers: BTreeMap<String, String>,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            endpoint: String::new(),
            headers,
        };

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        for node in nodes.values() {
            let _ = node.tx.send(TransportEvent::PeerEntered(info.clone()));
            let _ = tx.send(TransportEvent::PeerEntered(node.info.clone()));
        }
        debug!(peer = %info.id, name, "Loopback node connected");
        nodes.insert(
            info.id.clone(),
            Node {
                info: info.clone(),
                channels: HashSet::new(),
                tx,
            },
        );

        let transport = LoopbackTransport {
            hub: self.clone(),
            id: info.id,
        };
        (transport, rx)
    }

    /// Number of attached nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn disconnect(&self, id: &str) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if nodes.remove(id).is_some() {
            debug!(peer = %id, "Loopback node disconnected");
            for node in nodes.values() {
                let _ = node.tx.send(TransportEvent::PeerExited {
                    peer_id: id.to_string(),
                });
            }
        }
    }
}

/// One node attached to a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: String,
}

impl LoopbackTransport {
    fn with_self<T>(&self, f: impl FnOnce(&mut Node) -> T) -> Result<T, WireError> {
        let mut nodes = self.hub.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.get_mut(&self.id).map(f).ok_or(WireError::Shutdown)
    }
}

impl Transport for LoopbackTransport {
    fn peer_id(&self) -> &str {
        &self.id
    }

    fn join(&self, channel: &str) -> Result<(), WireError> {
        self.with_self(|node| {
            node.channels.insert(channel.to_string());
        })
    }

    fn leave(&self, channel: &str) -> Result<(), WireError> {
        self.with_self(|node| {
            node.channels.remove(channel);
        })
    }

    fn shout(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError> {
        let nodes = self.hub.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if !nodes.contains_key(&self.id) {
            return Err(WireError::Shutdown);
        }
        for (id, node) in nodes.iter() {
            if *id != self.id && node.channels.contains(channel) {
                let _ = node.tx.send(TransportEvent::Shout {
                    peer_id: self.id.clone(),
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn whisper(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), WireError> {
        let nodes = self.hub.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if !nodes.contains_key(&self.id) {
            return Err(WireError::Shutdown);
        }
        let node = nodes
            .get(peer_id)
            .filter(|_| peer_id != self.id)
            .ok_or_else(|| WireError::UnknownPeer(peer_id.to_string()))?;
        let _ = node.tx.send(TransportEvent::Whisper {
            peer_id: self.id.clone(),
            payload,
        });
        Ok(())
    }

    fn peers(&self) -> Vec<PeerInfo> {
        let nodes = self.hub.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .filter(|n| n.info.id != self.id)
            .map(|n| n.info.clone())
            .collect()
    }

    fn shutdown(&self) {
        self.hub.disconnect(&self.id);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.hub.disconnect(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_enter_events_both_ways() {
        let hub = LoopbackHub::new();
        let (a, mut rx_a) = hub.connect("a", BTreeMap::new());
        let (b, mut rx_b) = hub.connect("b", BTreeMap::new());

        assert_eq!(
            drain(&mut rx_a),
            vec![TransportEvent::PeerEntered(a.peers()[0].clone())]
        );
        match drain(&mut rx_b).as_slice() {
            [TransportEvent::PeerEntered(info)] => assert_eq!(info.id, a.peer_id()),
            other => panic!("Expected one PeerEntered, got {other:?}"),
        }
    }

    #[test]
    fn test_shout_only_to_subscribers_not_self() {
        let hub = LoopbackHub::new();
        let (a, mut rx_a) = hub.connect("a", BTreeMap::new());
        let (_b, mut rx_b) = hub.connect("b", BTreeMap::new());
        let (c, mut rx_c) = hub.connect("c", BTreeMap::new());
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        a.join("chat").unwrap();
        c.join("chat").unwrap();
        a.shout("chat", b"hi".to_vec()).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(
            drain(&mut rx_c),
            vec![TransportEvent::Shout {
                peer_id: a.peer_id().to_string(),
                channel: "chat".to_string(),
                payload: b"hi".to_vec(),
            }]
        );
    }

    #[test]
    fn test_whisper_and_unknown_peer() {
        let hub = LoopbackHub::new();
        let (a, _rx_a) = hub.connect("a", BTreeMap::new());
        let (b, mut rx_b) = hub.connect("b", BTreeMap::new());
        drain(&mut rx_b);

        a.whisper(b.peer_id(), b"x".to_vec()).unwrap();
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(matches!(
            a.whisper("nobody", vec![]),
            Err(WireError::UnknownPeer(_))
        ));
        assert!(a.whisper(a.peer_id(), vec![]).is_err());
    }

    #[test]
    fn test_shutdown_announces_exit() {
        let hub = LoopbackHub::new();
        let (a, _rx_a) = hub.connect("a", BTreeMap::new());
        let (_b, mut rx_b) = hub.connect("b", BTreeMap::new());
        drain(&mut rx_b);

        let a_id = a.peer_id().to_string();
        a.shutdown();
        assert_eq!(
            drain(&mut rx_b),
            vec![TransportEvent::PeerExited { peer_id: a_id }]
        );
        assert!(matches!(a.shout("x", vec![]), Err(WireError::Shutdown)));
        drop(a);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.len(), 1);
    }
}
