//! Events delivered to user callbacks.
//!
//! Every callback runs on the kernel's worker thread and receives one of the
//! payloads below by reference.

use crate::agent::AgentId;
use crate::value::{IoKind, IoValue, ValueType};
use serde::{Deserialize, Serialize};

/// Sentinel timestamp used when the sender attached none.
pub const NO_TIMESTAMP: i64 = i64::MIN;

/// What happened to a peer or a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    /// A new peer joined the bus.
    PeerEntered,
    /// A peer left or timed out.
    PeerExited,
    /// A remote agent became known.
    AgentEntered,
    /// A remote agent changed its definition.
    AgentUpdatedDefinition,
    /// A remote agent acknowledged our own announcement.
    AgentKnowsUs,
    /// A remote agent stopped or its peer left.
    AgentExited,
    /// A remote agent changed its mapping.
    AgentUpdatedMapping,
    /// The local agent won an election. `data` holds the election name.
    AgentWonElection,
    /// The local agent lost an election. `data` holds the election name.
    AgentLostElection,
}

/// An agent event.
///
/// For peer events `uuid` is `None` and `name` is the peer name; `data`
/// carries the transport peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub uuid: Option<AgentId>,
    pub name: String,
    pub data: Option<String>,
}

impl AgentEvent {
    pub fn new(kind: AgentEventKind, uuid: Option<AgentId>, name: impl Into<String>) -> Self {
        Self {
            kind,
            uuid,
            name: name.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Network monitor observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// The monitored device is back with a usable address.
    NetworkOk { device: String, ip: String },
    /// The monitored device disappeared.
    DeviceNotAvailable { device: String },
    /// The device is present but its address changed.
    AddressChanged { device: String, ip: String },
    /// The transport was restarted after a manual or automatic stop.
    OkAfterManualRestart { device: String, ip: String },
}

/// A value change on an IO, as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct IoUpdate {
    pub kind: IoKind,
    pub name: String,
    pub value_type: ValueType,
    /// `None` for impulsions.
    pub value: Option<IoValue>,
    /// Sender-side microseconds, or [`NO_TIMESTAMP`].
    pub timestamp: i64,
}

impl IoUpdate {
    pub fn has_timestamp(&self) -> bool {
        self.timestamp != NO_TIMESTAMP
    }
}

/// An incoming service invocation, as seen by the service callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub sender_name: String,
    pub sender_uuid: AgentId,
    pub service: String,
    pub arguments: Vec<IoValue>,
    /// Caller-supplied correlation token, echoed back by replies.
    pub token: Option<String>,
    /// Sender-side microseconds, or [`NO_TIMESTAMP`].
    pub timestamp: i64,
}

/// A user channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub sender_name: String,
    pub sender_uuid: AgentId,
    /// `None` for whispers.
    pub channel: Option<String>,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// The payload as UTF-8, when it is valid text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let ev = AgentEvent::new(AgentEventKind::AgentWonElection, Some(AgentId::new()), "a")
            .with_data("leader");
        assert_eq!(ev.data.as_deref(), Some("leader"));
    }

    #[test]
    fn test_monitor_event_serde() {
        let ev = MonitorEvent::AddressChanged {
            device: "eth0".into(),
            ip: "10.0.0.2".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"address_changed\""));
    }

    #[test]
    fn test_channel_text() {
        let msg = ChannelMessage {
            sender_name: "a".into(),
            sender_uuid: AgentId::new(),
            channel: Some("chat".into()),
            payload: b"hi".to_vec(),
        };
        assert_eq!(msg.text(), Some("hi"));
    }
}
