//! agentbus transport layer: peer discovery, channels and security.
//!
//! The kernel talks to the network only through the [`Transport`] trait:
//! join/leave channels, shout to a channel, whisper to a peer, list peers.
//! Inbound traffic arrives as [`TransportEvent`]s.
//!
//! ## Architecture
//!
//! - **TcpTransport**: length-prefixed JSON links over TCP, found by UDP
//!   beacons or through brokers, optionally authenticated with ed25519 keys
//!   and encrypted with per-link AES-256-GCM keys
//! - **LoopbackHub**: the same contract inside one process
//! - **PeerRegistry**: tracks linked peers, their channels and links
//! - **Envelope**: the bus protocol carried in shout/whisper payloads

pub mod discovery;
pub mod envelope;
pub mod heartbeat;
pub mod loopback;
pub mod message;
pub mod peer;
pub mod registry;
pub mod security;
pub mod transport;

pub use envelope::{AgentSnapshot, Envelope};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use peer::{Discovery, TcpConfig, TcpTransport};
pub use registry::{PeerEntry, PeerRegistry};
pub use security::Identity;
pub use transport::{PeerInfo, Transport, TransportEvent, WireError};
