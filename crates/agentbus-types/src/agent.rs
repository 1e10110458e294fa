//! Agent identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, immutable identifier of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Generate a new random AgentId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Public identity and lifecycle flags of an agent, as announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub uuid: AgentId,
    /// Display name. Not unique across the bus.
    pub name: String,
    /// Licensing tag, free text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    /// Application-defined state string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub frozen: bool,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: AgentId::new(),
            name: name.into(),
            family: String::new(),
            state: String::new(),
            muted: false,
            frozen: false,
        }
    }

    /// Whether `target` designates this agent by name or uuid.
    pub fn is_addressed_by(&self, target: &str) -> bool {
        self.name == target || self.uuid.0.to_string() == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_parse() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_addressed_by_name_or_uuid() {
        let info = AgentInfo::new("pump");
        assert!(info.is_addressed_by("pump"));
        assert!(info.is_addressed_by(&info.uuid.to_string()));
        assert!(!info.is_addressed_by("valve"));
    }
}
