//! The transport seam between the kernel and the network.
//!
//! The kernel only needs four things from the network: publish bytes to a
//! channel, send bytes to one peer, receive bytes from peers and list the
//! current peers. [`Transport`] captures exactly that. Inbound traffic and
//! membership changes arrive as [`TransportEvent`]s on an unbounded channel
//! handed out by the transport's constructor.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Security error: {0}")]
    Security(String),
    #[error("Transport is shut down")]
    Shutdown,
}

/// A discovered peer, as reported to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Transport-level id. Unique per running transport.
    pub id: String,
    pub name: String,
    /// `tcp://ip:port` the peer is reachable at, empty for in-process peers.
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
}

/// Inbound traffic and membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerEntered(PeerInfo),
    PeerExited { peer_id: String },
    /// A message published on a channel we joined.
    Shout {
        peer_id: String,
        channel: String,
        payload: Vec<u8>,
    },
    /// A message addressed to us only.
    Whisper { peer_id: String, payload: Vec<u8> },
}

/// Minimal network collaborator used by the kernel.
///
/// Every method is non-blocking and best-effort: `Ok` means the message was
/// handed to the network, not that anybody received it.
pub trait Transport: Send + Sync + 'static {
    /// Our own transport-level id.
    fn peer_id(&self) -> &str;

    /// Subscribe to a channel. Idempotent.
    fn join(&self, channel: &str) -> Result<(), WireError>;

    /// Unsubscribe from a channel. Idempotent.
    fn leave(&self, channel: &str) -> Result<(), WireError>;

    /// Send to every peer that joined `channel`. Never delivered to ourselves.
    fn shout(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError>;

    /// Send to one peer.
    fn whisper(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), WireError>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Leave the network. Further sends fail with [`WireError::Shutdown`].
    fn shutdown(&self);
}
