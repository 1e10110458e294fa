//! UDP beacon discovery.
//!
//! Every node periodically broadcasts a small JSON beacon carrying its node id
//! and TCP endpoint on the discovery port. Nodes hearing a beacon from an
//! unknown peer dial its endpoint; the registry resolves double links.
//!
//! Only one process per host can bind the discovery port. Later processes run
//! send-only: they are still found by the listening process, which dials them.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Beacon magic, so stray datagrams are ignored.
pub const BEACON_PROTOCOL: &str = "agentbus";

/// Largest beacon we accept.
const MAX_BEACON_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol: String,
    pub version: u32,
    pub node_id: String,
    /// `tcp://ip:port` of the sender's listener.
    pub endpoint: String,
}

impl Beacon {
    pub fn new(node_id: &str, endpoint: &str) -> Self {
        Self {
            protocol: BEACON_PROTOCOL.to_string(),
            version: crate::message::PROTOCOL_VERSION,
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a datagram. Foreign or incompatible beacons yield `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let beacon: Beacon = serde_json::from_slice(bytes).ok()?;
        (beacon.protocol == BEACON_PROTOCOL && beacon.version == crate::message::PROTOCOL_VERSION)
            .then_some(beacon)
    }
}

/// Where beacons are sent for a given bind IP.
///
/// Loopback binds stay on the host; anything else goes to the limited
/// broadcast address.
pub fn beacon_target(ip: IpAddr, port: u16) -> SocketAddr {
    if ip.is_loopback() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
    }
}

/// Run beacon discovery until the task is aborted.
///
/// Heard beacons from other nodes are forwarded on `found`.
pub async fn run_beacon(
    beacon: Beacon,
    ip: IpAddr,
    port: u16,
    interval: Duration,
    found: mpsc::UnboundedSender<Beacon>,
) {
    let listener = match UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        .await
    {
        Ok(sock) => Some(sock),
        Err(e) => {
            warn!(port, error = %e, "Discovery port busy, running send-only");
            None
        }
    };

    let sender = match UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await
    {
        Ok(sock) => sock,
        Err(e) => {
            warn!(error = %e, "Cannot open beacon socket, discovery disabled");
            return;
        }
    };
    if let Err(e) = sender.set_broadcast(true) {
        warn!(error = %e, "Cannot enable broadcast on beacon socket");
    }

    let target = beacon_target(ip, port);
    let payload = beacon.encode();
    let mut ticker = tokio::time::interval(interval);
    let mut buf = vec![0u8; MAX_BEACON_SIZE];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sender.send_to(&payload, target).await {
                    debug!(%target, error = %e, "Beacon send failed");
                }
            }
            received = recv(listener.as_ref(), &mut buf) => {
                let Some(len) = received else { continue };
                match Beacon::decode(&buf[..len]) {
                    Some(heard) if heard.node_id != beacon.node_id => {
                        if found.send(heard).is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn recv(sock: Option<&UdpSocket>, buf: &mut [u8]) -> Option<usize> {
    match sock {
        Some(sock) => sock.recv_from(buf).await.ok().map(|(len, _)| len),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_decode_filters_foreign() {
        let b = Beacon::new("n1", "tcp://10.0.0.1:4000");
        assert_eq!(Beacon::decode(&b.encode()), Some(b));
        assert!(Beacon::decode(b"hello").is_none());
        let mut other = Beacon::new("n1", "tcp://x:1");
        other.protocol = "zyre".into();
        assert!(Beacon::decode(&other.encode()).is_none());
    }

    #[test]
    fn test_beacon_target() {
        let lo = beacon_target("127.0.0.1".parse().unwrap(), 5670);
        assert_eq!(lo, "127.0.0.1:5670".parse().unwrap());
        let lan = beacon_target("192.168.1.4".parse().unwrap(), 5670);
        assert_eq!(lan, "255.255.255.255:5670".parse().unwrap());
    }
}
