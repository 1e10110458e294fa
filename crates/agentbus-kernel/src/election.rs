//! Election coordinator: one winner among competing peers.
//!
//! Every peer sees the same candidate set (its own agents plus the remote
//! candidates it learned from announcements) and applies the same rule, so
//! no votes are exchanged: the candidate peer with the lowest transport id
//! wins. All agents of one peer in the same election share its outcome.
//!
//! A lone candidate stays unresolved until a second peer competes. Once an
//! election has been contested, the last remaining candidate wins.

use agentbus_types::agent::AgentId;
use agentbus_types::error::{BusError, BusResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost,
}

/// Local agents to notify of an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub election: String,
    pub outcome: Outcome,
    pub agents: Vec<AgentId>,
}

#[derive(Debug, Default)]
struct Election {
    local: BTreeSet<AgentId>,
    remote: BTreeMap<String, BTreeSet<AgentId>>,
    contested: bool,
    last: Option<Outcome>,
}

impl Election {
    fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.values().all(BTreeSet::is_empty)
    }

    fn resolve(&mut self, name: &str, local_peer: Option<&str>, joined: Option<AgentId>) -> Option<Resolution> {
        let Some(local_peer) = local_peer.filter(|_| !self.local.is_empty()) else {
            self.last = None;
            self.contested = self.contested && !self.local.is_empty();
            return None;
        };

        let mut rivals = self
            .remote
            .iter()
            .filter(|(_, agents)| !agents.is_empty())
            .map(|(peer, _)| peer.as_str())
            .peekable();
        let outcome = if rivals.peek().is_none() {
            if !self.contested {
                return None;
            }
            Outcome::Won
        } else {
            self.contested = true;
            if rivals.all(|peer| local_peer < peer) {
                Outcome::Won
            } else {
                Outcome::Lost
            }
        };

        let agents: Vec<AgentId> = if self.last != Some(outcome) {
            self.last = Some(outcome);
            self.local.iter().copied().collect()
        } else {
            joined.into_iter().collect()
        };
        (!agents.is_empty()).then(|| Resolution {
            election: name.to_string(),
            outcome,
            agents,
        })
    }
}

/// Election state of one kernel.
#[derive(Default)]
pub struct ElectionCoordinator {
    local_peer: RwLock<Option<String>>,
    elections: Mutex<HashMap<String, Election>>,
}

impl ElectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_peer(&self) -> Option<String> {
        self.local_peer.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set while the transport runs. Without a peer id nothing resolves.
    pub fn set_local_peer(&self, peer: Option<String>) {
        *self.local_peer.write().unwrap_or_else(|e| e.into_inner()) = peer;
    }

    fn update(
        &self,
        election: &str,
        joined: Option<AgentId>,
        f: impl FnOnce(&mut Election) -> BusResult<()>,
    ) -> BusResult<Option<Resolution>> {
        let local_peer = self.local_peer();
        let mut elections = self.elections.lock().unwrap_or_else(|e| e.into_inner());
        let state = elections.entry(election.to_string()).or_default();
        f(state)?;
        let resolution = state.resolve(election, local_peer.as_deref(), joined);
        if state.is_empty() {
            elections.remove(election);
        }
        Ok(resolution)
    }

    /// Enter a local agent as candidate.
    pub fn join(&self, election: &str, agent: AgentId) -> BusResult<Option<Resolution>> {
        self.update(election, Some(agent), |e| {
            if !e.local.insert(agent) {
                return Err(BusError::InvalidState(format!(
                    "agent {agent} already competes in '{election}'"
                )));
            }
            Ok(())
        })
    }

    pub fn leave(&self, election: &str, agent: AgentId) -> BusResult<Option<Resolution>> {
        if !self.is_candidate(election, agent) {
            return Err(BusError::InvalidState(format!(
                "agent {agent} does not compete in '{election}'"
            )));
        }
        self.update(election, None, |e| {
            e.local.remove(&agent);
            Ok(())
        })
    }

    pub fn remote_join(&self, peer: &str, election: &str, agent: AgentId) -> Option<Resolution> {
        debug!(peer, election, %agent, "Remote candidate joined");
        self.update(election, None, |e| {
            e.remote.entry(peer.to_string()).or_default().insert(agent);
            Ok(())
        })
        .ok()
        .flatten()
    }

    pub fn remote_leave(&self, peer: &str, election: &str, agent: AgentId) -> Option<Resolution> {
        self.update(election, None, |e| {
            if let Some(agents) = e.remote.get_mut(peer) {
                agents.remove(&agent);
                if agents.is_empty() {
                    e.remote.remove(peer);
                }
            }
            Ok(())
        })
        .ok()
        .flatten()
    }

    /// Remove one remote agent from every election.
    pub fn remote_agent_left(&self, peer: &str, agent: AgentId) -> Vec<Resolution> {
        self.elections_where(|e| e.remote.get(peer).is_some_and(|a| a.contains(&agent)))
            .into_iter()
            .filter_map(|name| self.remote_leave(peer, &name, agent))
            .collect()
    }

    /// Remove every candidate of `peer`.
    pub fn peer_exited(&self, peer: &str) -> Vec<Resolution> {
        self.elections_where(|e| e.remote.contains_key(peer))
            .into_iter()
            .filter_map(|name| {
                self.update(&name, None, |e| {
                    e.remote.remove(peer);
                    Ok(())
                })
                .ok()
                .flatten()
            })
            .collect()
    }

    fn elections_where(&self, pred: impl Fn(&Election) -> bool) -> Vec<String> {
        self.elections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_candidate(&self, election: &str, agent: AgentId) -> bool {
        self.elections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(election)
            .is_some_and(|e| e.local.contains(&agent))
    }

    /// Elections a local agent competes in, sorted.
    pub fn elections_of(&self, agent: AgentId) -> Vec<String> {
        let mut names = self.elections_where(|e| e.local.contains(&agent));
        names.sort();
        names
    }

    /// Forget everything learned from other peers.
    pub fn clear_remote(&self) {
        let mut elections = self.elections.lock().unwrap_or_else(|e| e.into_inner());
        for e in elections.values_mut() {
            e.remote.clear();
            e.contested = false;
            e.last = None;
        }
        elections.retain(|_, e| !e.is_empty());
    }

    /// Forget all elections.
    pub fn clear(&self) {
        self.elections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
