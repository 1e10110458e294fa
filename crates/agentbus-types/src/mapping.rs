//! Mapping tables: which remote outputs feed which local inputs.

use crate::error::BusResult;
use serde::{Deserialize, Serialize};

/// One routing rule: `agent.output` feeds our `input`.
///
/// `id` is assigned by the owning mapping engine and is never reused while
/// the entry is alive. It is not part of the persisted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(default, skip_serializing)]
    pub id: u64,
    pub input: String,
    pub agent: String,
    pub output: String,
}

impl MappingEntry {
    pub fn new(
        id: u64,
        input: impl Into<String>,
        agent: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id,
            input: input.into(),
            agent: agent.into(),
            output: output.into(),
        }
    }

    /// Whether this entry has the given (input, agent, output) triple.
    pub fn matches(&self, input: &str, agent: &str, output: &str) -> bool {
        self.input == input && self.agent == agent && self.output == output
    }
}

/// Plain mappings and splits of one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTable {
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<MappingEntry>,
}

impl MappingTable {
    pub fn from_json(json: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> BusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty() && self.splits.is_empty()
    }

    /// Whether any entry pulls from `agent`.
    pub fn references_agent(&self, agent: &str) -> bool {
        self.mappings
            .iter()
            .chain(self.splits.iter())
            .any(|e| e.agent == agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_not_persisted() {
        let table = MappingTable {
            mappings: vec![MappingEntry::new(7, "in", "B", "out")],
            splits: vec![],
        };
        let json = table.to_json().unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("splits"));
        let back = MappingTable::from_json(&json).unwrap();
        assert_eq!(back.mappings[0].id, 0);
        assert!(back.mappings[0].matches("in", "B", "out"));
    }

    #[test]
    fn test_references_agent() {
        let table = MappingTable {
            mappings: vec![],
            splits: vec![MappingEntry::new(1, "in", "B", "out")],
        };
        assert!(table.references_agent("B"));
        assert!(!table.references_agent("C"));
    }
}
