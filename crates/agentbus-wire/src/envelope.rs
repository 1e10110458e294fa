//! Bus protocol envelopes.
//!
//! Envelopes are what agents say to each other. They are JSON documents
//! carried as the payload of transport shouts and whispers, so the same
//! protocol runs over TCP links and the in-process loopback hub.

use agentbus_types::agent::{AgentId, AgentInfo};
use agentbus_types::definition::Definition;
use agentbus_types::mapping::MappingTable;
use agentbus_types::value::IoValue;
use serde::{Deserialize, Serialize};

/// Channel every kernel joins for announcements and elections.
pub const SYSTEM_CHANNEL: &str = "agentbus";

/// Prefix of every channel reserved by the bus itself.
pub const RESERVED_PREFIX: &str = "agentbus";

/// Channel on which an agent's outputs are published.
pub fn output_channel(agent_name: &str) -> String {
    format!("{SYSTEM_CHANNEL}/outputs/{agent_name}")
}

/// Whether a user channel name collides with bus channels.
pub fn is_reserved_channel(channel: &str) -> bool {
    channel.starts_with(RESERVED_PREFIX)
}

/// Everything a peer needs to know about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub info: AgentInfo,
    pub definition: Definition,
    #[serde(default)]
    pub mapping: MappingTable,
    /// Elections this agent currently takes part in.
    #[serde(default)]
    pub elections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Full state of a kernel's started agents, whispered to new peers.
    Hello { agents: Vec<AgentSnapshot> },
    AgentEntered { agent: AgentSnapshot },
    AgentExited { uuid: AgentId },
    /// Name, state or flags changed.
    AgentUpdated { info: AgentInfo },
    DefinitionUpdated { uuid: AgentId, definition: Definition },
    MappingUpdated { uuid: AgentId, mapping: MappingTable },
    /// Remote agents acknowledge that they received our announcement.
    Known {
        knowers: Vec<AgentInfo>,
        known: Vec<AgentId>,
    },
    Output {
        uuid: AgentId,
        agent_name: String,
        name: String,
        value: IoValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// Ask `target` to whisper back the current value of all its outputs.
    OutputsRequest { requester: AgentId, target: AgentId },
    ServiceCall {
        caller: AgentId,
        caller_name: String,
        target: AgentId,
        service: String,
        arguments: Vec<IoValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Election {
        election: String,
        candidate: AgentId,
        joined: bool,
    },
    /// User channel message. `target` is set for whispers.
    Channel {
        sender: AgentId,
        sender_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<AgentId>,
        #[serde(with = "agentbus_types::serde_compat")]
        payload: Vec<u8>,
    },
    /// Forced stop request.
    Stop { sender_name: String, target: AgentId },
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::AgentEntered { .. } => "agent_entered",
            Envelope::AgentExited { .. } => "agent_exited",
            Envelope::AgentUpdated { .. } => "agent_updated",
            Envelope::DefinitionUpdated { .. } => "definition_updated",
            Envelope::MappingUpdated { .. } => "mapping_updated",
            Envelope::Known { .. } => "known",
            Envelope::Output { .. } => "output",
            Envelope::OutputsRequest { .. } => "outputs_request",
            Envelope::ServiceCall { .. } => "service_call",
            Envelope::Election { .. } => "election",
            Envelope::Channel { .. } => "channel",
            Envelope::Stop { .. } => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_envelope_shape() {
        let env = Envelope::Output {
            uuid: AgentId::new(),
            agent_name: "B".into(),
            name: "out1".into(),
            value: IoValue::Int(42),
            timestamp: None,
        };
        let json = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(json.contains(r#""type":"output""#));
        assert!(json.contains(r#""value":{"type":"int","value":42}"#));
        assert!(!json.contains("timestamp"));
        assert_eq!(Envelope::decode(json.as_bytes()).unwrap(), env);
    }

    #[test]
    fn test_service_call_keeps_token() {
        let env = Envelope::ServiceCall {
            caller: AgentId::new(),
            caller_name: "A".into(),
            target: AgentId::new(),
            service: "add".into(),
            arguments: vec![IoValue::Int(1), IoValue::Double(2.5)],
            token: Some("t-1".into()),
            timestamp: Some(12),
        };
        match Envelope::decode(&env.encode().unwrap()).unwrap() {
            Envelope::ServiceCall { token, arguments, timestamp, .. } => {
                assert_eq!(token.as_deref(), Some("t-1"));
                assert_eq!(arguments.len(), 2);
                assert_eq!(timestamp, Some(12));
            }
            other => panic!("Expected ServiceCall, got {other:?}"),
        }
    }

    #[test]
    fn test_reserved_channels() {
        assert!(is_reserved_channel("agentbus"));
        assert!(is_reserved_channel(&output_channel("B")));
        assert!(!is_reserved_channel("chat"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Envelope::decode(b"{\"type\":\"nope\"}").is_err());
        assert!(Envelope::decode(b"\x00\x01").is_err());
    }
}
