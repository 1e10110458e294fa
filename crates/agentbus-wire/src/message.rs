//! Link-level frames exchanged between TCP peers.
//!
//! Every frame is a [`WireMessage`] encoded as JSON and prefixed with a
//! 4-byte big-endian length header. Bus traffic (definitions, outputs,
//! service calls, elections) rides inside `Shout`/`Whisper` payloads as an
//! opaque byte string; see [`crate::envelope`].
//!
//! On a secured link the handshake travels in clear, and the body of every
//! later frame is sealed (see [`crate::security::Session`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A link frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID.
    pub id: String,
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// A notification with a fresh id.
    pub fn notification(notification: WireNotification) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Notification(notification),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    #[serde(rename = "request")]
    Request(WireRequest),
    #[serde(rename = "response")]
    Response(WireResponse),
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Identity a peer presents during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHello {
    pub node_id: String,
    pub node_name: String,
    pub protocol_version: u32,
    /// `tcp://ip:port` of the peer's listener.
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Channels the peer has already joined.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Hex ed25519 public key. Empty when security is off.
    #[serde(default)]
    pub public_key: String,
    /// Random nonce, fresh per handshake.
    #[serde(default)]
    pub nonce: String,
    /// Hex signature, see [`crate::security::handshake_payload`].
    #[serde(default)]
    pub signature: String,
    /// Hex x25519 key for the link's frame encryption. Empty when security is off.
    #[serde(default)]
    pub exchange_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    #[serde(rename = "handshake")]
    Handshake(PeerHello),
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    #[serde(rename = "handshake_ack")]
    HandshakeAck(PeerHello),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// Endpoint of a peer known to a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPeer {
    pub node_id: String,
    pub endpoint: String,
}

/// One-way frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    #[serde(rename = "join")]
    Join { channel: String },
    #[serde(rename = "leave")]
    Leave { channel: String },
    #[serde(rename = "shout")]
    Shout {
        channel: String,
        #[serde(with = "agentbus_types::serde_compat")]
        payload: Vec<u8>,
    },
    #[serde(rename = "whisper")]
    Whisper {
        #[serde(with = "agentbus_types::serde_compat")]
        payload: Vec<u8>,
    },
    /// Sent by brokers so that their peers connect to each other directly.
    #[serde(rename = "gossip")]
    Gossip { peers: Vec<GossipPeer> },
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a frame (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a frame.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix() {
        let msg = WireMessage {
            id: "msg-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Ping),
        };
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, "msg-1");
    }

    #[test]
    fn test_handshake_shape() {
        let msg = WireMessage {
            id: "hs-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake(PeerHello {
                node_id: "node-a".to_string(),
                node_name: "lab".to_string(),
                protocol_version: PROTOCOL_VERSION,
                endpoint: "tcp://10.0.0.1:5670".to_string(),
                channels: vec!["agentbus".to_string()],
                ..Default::default()
            })),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""method":"handshake""#));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            WireMessageKind::Request(WireRequest::Handshake(hello)) => {
                assert_eq!(hello.node_id, "node-a");
                assert_eq!(hello.channels, vec!["agentbus".to_string()]);
                assert!(hello.public_key.is_empty());
            }
            other => panic!("Expected Handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_shout_payload_is_base64() {
        let msg = WireMessage::notification(WireNotification::Shout {
            channel: "chat".to_string(),
            payload: b"hi".to_vec(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""payload":"aGk=""#));
        let bytes = encode_message(&msg).unwrap();
        match decode_message(&bytes[4..]).unwrap().kind {
            WireMessageKind::Notification(WireNotification::Shout { channel, payload }) => {
                assert_eq!(channel, "chat");
                assert_eq!(payload, b"hi");
            }
            other => panic!("Expected Shout, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response() {
        let msg = WireMessage {
            id: "err-1".to_string(),
            kind: WireMessageKind::Response(WireResponse::Error {
                code: 403,
                message: "Unknown public key".to_string(),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            decoded.kind,
            WireMessageKind::Response(WireResponse::Error { code: 403, .. })
        ));
    }
}
