//! What this kernel knows about other peers and the agents they host.
//!
//! Filled by the worker from announcements; read by application threads to
//! resolve call and whisper targets.

use agentbus_types::agent::{AgentId, AgentInfo};
use agentbus_types::definition::Definition;
use agentbus_types::mapping::MappingTable;
use agentbus_wire::{AgentSnapshot, PeerInfo};
use std::collections::HashMap;
use std::sync::RwLock;

/// An agent hosted by another peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAgent {
    pub peer_id: String,
    pub info: AgentInfo,
    pub definition: Definition,
    pub mapping: MappingTable,
    pub elections: Vec<String>,
}

#[derive(Default)]
pub struct RemoteRegistry {
    peers: RwLock<HashMap<String, PeerInfo>>,
    agents: RwLock<HashMap<AgentId, RemoteAgent>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the peer was already known.
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.id.clone(), info)
            .is_none()
    }

    /// Forget a peer and every agent it hosted.
    pub fn remove_peer(&self, peer_id: &str) -> Option<(PeerInfo, Vec<RemoteAgent>)> {
        let info = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)?;
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let gone: Vec<AgentId> = agents
            .values()
            .filter(|a| a.peer_id == peer_id)
            .map(|a| a.info.uuid)
            .collect();
        let removed = gone.iter().filter_map(|id| agents.remove(id)).collect();
        Some((info, removed))
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Peers whose id or name is `target`.
    pub fn find_peers(&self, target: &str) -> Vec<PeerInfo> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| p.id == target || p.name == target)
            .cloned()
            .collect()
    }

    /// Record an announced agent. Returns the previous record, if any.
    pub fn upsert(&self, peer_id: &str, snapshot: AgentSnapshot) -> Option<RemoteAgent> {
        let agent = RemoteAgent {
            peer_id: peer_id.to_string(),
            info: snapshot.info,
            definition: snapshot.definition,
            mapping: snapshot.mapping,
            elections: snapshot.elections,
        };
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.info.uuid, agent)
    }

    pub fn remove_agent(&self, uuid: AgentId) -> Option<RemoteAgent> {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uuid)
    }

    /// Apply `f` to a known agent. Returns false for unknown agents.
    pub fn update(&self, uuid: AgentId, f: impl FnOnce(&mut RemoteAgent)) -> bool {
        match self
            .agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&uuid)
        {
            Some(agent) => {
                f(agent);
                true
            }
            None => false,
        }
    }

    pub fn agent(&self, uuid: AgentId) -> Option<RemoteAgent> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&uuid)
            .cloned()
    }

    pub fn agents(&self) -> Vec<RemoteAgent> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Agents addressed by `target` (a name or a uuid). Names may match several.
    pub fn find(&self, target: &str) -> Vec<RemoteAgent> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|a| a.info.is_addressed_by(target))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.agents.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn peer(id: &str, name: &str) -> PeerInfo {
        PeerInfo {
            id: id.into(),
            name: name.into(),
            endpoint: String::new(),
            headers: BTreeMap::new(),
        }
    }

    fn snapshot(name: &str) -> AgentSnapshot {
        AgentSnapshot {
            info: AgentInfo::new(name),
            definition: Definition::default(),
            mapping: MappingTable::default(),
            elections: vec![],
        }
    }

    #[test]
    fn test_peer_removal_takes_its_agents() {
        let reg = RemoteRegistry::new();
        assert!(reg.add_peer(peer("p1", "host-1")));
        assert!(!reg.add_peer(peer("p1", "host-1")));
        reg.add_peer(peer("p2", "host-2"));
        reg.upsert("p1", snapshot("a"));
        reg.upsert("p1", snapshot("b"));
        reg.upsert("p2", snapshot("c"));

        let (info, gone) = reg.remove_peer("p1").unwrap();
        assert_eq!(info.name, "host-1");
        assert_eq!(gone.len(), 2);
        assert_eq!(reg.agents().len(), 1);
        assert!(reg.remove_peer("p1").is_none());
    }

    #[test]
    fn test_find_by_name_or_uuid() {
        let reg = RemoteRegistry::new();
        let one = snapshot("twin");
        let uuid = one.info.uuid;
        reg.upsert("p1", one);
        reg.upsert("p2", snapshot("twin"));
        assert_eq!(reg.find("twin").len(), 2);
        assert_eq!(reg.find(&uuid.to_string()).len(), 1);
        assert!(reg.find("nobody").is_empty());
    }

    #[test]
    fn test_update_and_peer_lookup() {
        let reg = RemoteRegistry::new();
        reg.add_peer(peer("p1", "host"));
        let snap = snapshot("a");
        let uuid = snap.info.uuid;
        assert!(reg.upsert("p1", snap).is_none());
        assert!(reg.update(uuid, |a| a.info.name = "renamed".into()));
        assert_eq!(reg.agent(uuid).unwrap().info.name, "renamed");
        assert!(!reg.update(AgentId::new(), |_| {}));
        assert_eq!(reg.find_peers("host").len(), 1);
        assert_eq!(reg.find_peers("p1").len(), 1);
        reg.clear();
        assert!(reg.peers().is_empty());
    }
}
