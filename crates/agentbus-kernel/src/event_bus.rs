//! Event bus: agent events as broadcast streams, with a history ring buffer.
//!
//! Observers registered on an agent run on the worker. The bus is the
//! other way in: any task or thread can subscribe and read events at its
//! own pace. Slow receivers lag and lose the oldest events.

use agentbus_types::agent::AgentId;
use agentbus_types::event::AgentEvent;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum events retained in the history ring buffer.
const HISTORY_SIZE: usize = 1000;

/// An event together with the local agent it was delivered to.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub agent: AgentId,
    pub event: AgentEvent,
}

pub struct EventBus {
    /// Every event for every agent.
    sender: broadcast::Sender<Delivered>,
    agent_channels: DashMap<AgentId, broadcast::Sender<AgentEvent>>,
    history: Mutex<VecDeque<Delivered>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            agent_channels: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
        }
    }

    pub fn publish(&self, agent: AgentId, event: AgentEvent) {
        trace!(%agent, kind = ?event.kind, name = %event.name, "Publishing agent event");
        let delivered = Delivered { agent, event };
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(delivered.clone());
        }
        if let Some(sender) = self.agent_channels.get(&agent) {
            let _ = sender.send(delivered.event.clone());
        }
        let _ = self.sender.send(delivered);
    }

    /// Subscribe to the events of one agent.
    pub fn subscribe_agent(&self, agent: AgentId) -> broadcast::Receiver<AgentEvent> {
        self.agent_channels
            .entry(agent)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Delivered> {
        self.sender.subscribe()
    }

    /// Most recent events first.
    pub fn history(&self, limit: usize) -> Vec<Delivered> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent events of one agent first.
    pub fn agent_history(&self, agent: AgentId, limit: usize) -> Vec<AgentEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .rev()
            .filter(|d| d.agent == agent)
            .take(limit)
            .map(|d| d.event.clone())
            .collect()
    }

    pub fn unsubscribe_agent(&self, agent: AgentId) {
        self.agent_channels.remove(&agent);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
