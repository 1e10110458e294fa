//! TcpTransport: the TCP implementation of [`Transport`].
//!
//! A [`TcpTransport`] binds a local TCP listener, finds peers through UDP
//! beacons or broker endpoints, and keeps one authenticated link per peer.
//! Each link performs a handshake to exchange identity, headers and joined
//! channels, then runs a reader task and a writer task. When security is on,
//! the handshake also agrees on per-link keys and every later frame is
//! encrypted. Frames to send are
//! queued on the link's unbounded channel, so every [`Transport`] method is
//! non-blocking.
//!
//! A transport started with `gossip` acts as a broker: each newly linked
//! peer is told the endpoints of all other peers and dials them directly.

use crate::discovery::{self, Beacon};
use crate::heartbeat::{self, HeartbeatConfig};
use crate::message::*;
use crate::registry::{LinkOutcome, PeerEntry, PeerLink, PeerRegistry};
use crate::security::{
    handshake_payload, FrameOpener, FrameSealer, Identity, KeyExchange, Role, Session,
};
use crate::transport::{PeerInfo, Transport, TransportEvent, WireError};

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a transport finds its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// Only explicit [`TcpTransport::connect_to`] calls.
    Manual,
    /// UDP beacons on `port`, sent for the interface bound at `ip`.
    Beacon { ip: IpAddr, port: u16 },
    /// Dial these `tcp://ip:port` brokers and keep the links up.
    Brokers(Vec<String>),
}

/// Configuration for a TcpTransport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Endpoint announced to peers. Defaults to the bound address.
    pub advertised_endpoint: Option<String>,
    pub node_id: String,
    pub node_name: String,
    pub headers: BTreeMap<String, String>,
    pub discovery: Discovery,
    /// Period of beacons and broker reconnection attempts.
    pub discovery_interval: Duration,
    pub heartbeat: HeartbeatConfig,
    /// Act as a broker for peers that dial us.
    pub gossip: bool,
    /// `None` disables authentication.
    pub identity: Option<Arc<Identity>>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertised_endpoint: None,
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: "agentbus-node".to_string(),
            headers: BTreeMap::new(),
            discovery: Discovery::Manual,
            discovery_interval: Duration::from_secs(1),
            heartbeat: HeartbeatConfig::default(),
            gossip: false,
            identity: None,
        }
    }
}

/// Parse a `tcp://ip:port` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr, WireError> {
    endpoint
        .strip_prefix("tcp://")
        .and_then(|rest| rest.parse::<SocketAddr>().ok())
        .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))
}

/// Format a socket address as an endpoint.
pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

/// State shared by the transport handle and its tasks.
struct Shared {
    node_id: String,
    node_name: String,
    endpoint: String,
    headers: BTreeMap<String, String>,
    gossip: bool,
    identity: Option<Arc<Identity>>,
    registry: PeerRegistry,
    channels: RwLock<HashSet<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Endpoints currently being dialed.
    dialing: Mutex<HashSet<String>>,
    next_link: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    fn hello(&self, nonces: &[&str], exchange: Option<&KeyExchange>) -> PeerHello {
        let own_nonce = nonces.last().copied().unwrap_or_default().to_string();
        let exchange_key = exchange.map(KeyExchange::public_key_hex).unwrap_or_default();
        let (public_key, signature) = match &self.identity {
            Some(identity) => (
                identity.public_key_hex(),
                identity.sign(&handshake_payload(nonces, &self.node_id, &exchange_key)),
            ),
            None => (String::new(), String::new()),
        };
        let mut channels: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        channels.sort();
        PeerHello {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            channels,
            public_key,
            nonce: own_nonce,
            signature,
            exchange_key,
        }
    }

    /// A key exchange for a new link, when links are secured.
    fn key_exchange(&self) -> Option<KeyExchange> {
        self.identity.as_ref().map(|_| KeyExchange::new())
    }

    /// Validate the remote side of a handshake.
    fn check_hello(&self, hello: &PeerHello, nonces: &[&str]) -> Result<(), (i32, WireError)> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err((
                1,
                WireError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: hello.protocol_version,
                },
            ));
        }
        if hello.node_id == self.node_id {
            return Err((
                409,
                WireError::HandshakeFailed("connected to ourselves".into()),
            ));
        }
        match (&self.identity, hello.public_key.is_empty()) {
            (None, true) => Ok(()),
            (None, false) | (Some(_), true) => Err((
                401,
                WireError::AuthenticationFailed("security settings differ".into()),
            )),
            (Some(identity), false) => identity
                .verify_peer(
                    &hello.public_key,
                    &handshake_payload(nonces, &hello.node_id, &hello.exchange_key),
                    &hello.signature,
                )
                .map_err(|e| (403, e)),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}

/// The TCP transport.
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node_id", &self.shared.node_id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TcpTransport {
    /// Bind the listener and start discovery and heartbeat tasks.
    ///
    /// Must be called from within a tokio runtime; all tasks are spawned on it.
    pub async fn start(
        config: TcpConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), WireError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let endpoint = config
            .advertised_endpoint
            .clone()
            .unwrap_or_else(|| format_endpoint(local_addr));

        info!(
            %local_addr,
            node_id = %config.node_id,
            secured = config.identity.is_some(),
            "Transport listening"
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            endpoint: endpoint.clone(),
            headers: config.headers.clone(),
            gossip: config.gossip,
            identity: config.identity.clone(),
            registry: PeerRegistry::new(),
            channels: RwLock::new(HashSet::new()),
            events,
            dialing: Mutex::new(HashSet::new()),
            next_link: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();
        let accept_shared = Arc::clone(&shared);
        tasks.push(tokio::spawn(async move {
            accept_loop(listener, accept_shared).await;
        }));

        let hb_shared = Arc::clone(&shared);
        let hb_config = config.heartbeat.clone();
        tasks.push(tokio::spawn(async move {
            heartbeat_loop(hb_shared, hb_config).await;
        }));

        match &config.discovery {
            Discovery::Manual => {}
            Discovery::Beacon { ip, port } => {
                let (found_tx, mut found_rx) = mpsc::unbounded_channel::<Beacon>();
                let beacon = Beacon::new(&config.node_id, &endpoint);
                let (ip, port, interval) = (*ip, *port, config.discovery_interval);
                tasks.push(tokio::spawn(async move {
                    discovery::run_beacon(beacon, ip, port, interval, found_tx).await;
                }));
                let dial_shared = Arc::clone(&shared);
                tasks.push(tokio::spawn(async move {
                    while let Some(heard) = found_rx.recv().await {
                        if !dial_shared.registry.contains(&heard.node_id) {
                            spawn_dial(Arc::clone(&dial_shared), heard.endpoint);
                        }
                    }
                }));
            }
            Discovery::Brokers(brokers) => {
                let brokers = brokers.clone();
                let interval = config.discovery_interval;
                let broker_shared = Arc::clone(&shared);
                tasks.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        for broker in &brokers {
                            if !broker_shared.registry.has_endpoint(broker) {
                                spawn_dial(Arc::clone(&broker_shared), broker.clone());
                            }
                        }
                    }
                }));
            }
        }

        let transport = Self {
            shared,
            local_addr,
            tasks: Mutex::new(tasks),
        };
        Ok((transport, events_rx))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint announced to peers.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Dial a peer and wait for the handshake to complete.
    pub async fn connect_to(&self, endpoint: &str) -> Result<(), WireError> {
        dial(Arc::clone(&self.shared), endpoint.to_string()).await
    }

    /// Number of linked peers.
    pub fn peer_count(&self) -> usize {
        self.shared.registry.count()
    }
}

impl Transport for TcpTransport {
    fn peer_id(&self) -> &str {
        &self.shared.node_id
    }

    fn join(&self, channel: &str) -> Result<(), WireError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(WireError::Shutdown);
        }
        let added = self
            .shared
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
        if added {
            for link in self.shared.registry.links() {
                link.send(WireMessage::notification(WireNotification::Join {
                    channel: channel.to_string(),
                }));
            }
        }
        Ok(())
    }

    fn leave(&self, channel: &str) -> Result<(), WireError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(WireError::Shutdown);
        }
        let removed = self
            .shared
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
        if removed {
            for link in self.shared.registry.links() {
                link.send(WireMessage::notification(WireNotification::Leave {
                    channel: channel.to_string(),
                }));
            }
        }
        Ok(())
    }

    fn shout(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(WireError::Shutdown);
        }
        let msg = WireMessage::notification(WireNotification::Shout {
            channel: channel.to_string(),
            payload,
        });
        for link in self.shared.registry.subscribers(channel) {
            link.send(msg.clone());
        }
        Ok(())
    }

    fn whisper(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), WireError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(WireError::Shutdown);
        }
        let link = self
            .shared
            .registry
            .link(peer_id)
            .ok_or_else(|| WireError::UnknownPeer(peer_id.to_string()))?;
        link.send(WireMessage::notification(WireNotification::Whisper { payload }));
        Ok(())
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .registry
            .all_peers()
            .into_iter()
            .map(|p| PeerInfo {
                id: p.node_id,
                name: p.node_name,
                endpoint: p.endpoint,
                headers: p.headers,
            })
            .collect()
    }

    fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = %self.shared.node_id, "Transport shutting down");
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        // Writers flush the goodbye, then exit once their sender is dropped.
        for peer in self.shared.registry.drain() {
            peer.link
                .send(WireMessage::notification(WireNotification::ShuttingDown));
            peer.link.close();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accept loop, run in a spawned task.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "Accepted connection");
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, addr, shared).await {
                        debug!(%addr, error = %e, "Inbound connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn spawn_dial(shared: Arc<Shared>, endpoint: String) {
    tokio::spawn(async move {
        if let Err(e) = dial(shared, endpoint.clone()).await {
            debug!(%endpoint, error = %e, "Dial failed");
        }
    });
}

/// Connect to a peer endpoint and perform the handshake as initiator.
async fn dial(shared: Arc<Shared>, endpoint: String) -> Result<(), WireError> {
    if endpoint == shared.endpoint || shared.stopped.load(Ordering::Acquire) {
        return Ok(());
    }
    if !shared
        .dialing
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(endpoint.clone())
    {
        return Ok(());
    }
    let result = dial_inner(&shared, &endpoint).await;
    shared
        .dialing
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&endpoint);
    result
}

async fn dial_inner(shared: &Arc<Shared>, endpoint: &str) -> Result<(), WireError> {
    let addr = parse_endpoint(endpoint)?;
    debug!(%endpoint, "Connecting to peer");
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();

    let nonce = uuid::Uuid::new_v4().to_string();
    let exchange = shared.key_exchange();
    let ours = shared.hello(&[nonce.as_str()], exchange.as_ref());
    let handshake = WireMessage {
        id: uuid::Uuid::new_v4().to_string(),
        kind: WireMessageKind::Request(WireRequest::Handshake(ours.clone())),
    };
    write_message(&mut writer, &handshake).await?;

    let response = read_message(&mut reader).await?;
    let hello = match response.kind {
        WireMessageKind::Response(WireResponse::HandshakeAck(hello)) => hello,
        WireMessageKind::Response(WireResponse::Error { code, message }) => {
            return Err(WireError::HandshakeFailed(format!(
                "Remote error {code}: {message}"
            )));
        }
        _ => {
            return Err(WireError::HandshakeFailed(
                "Unexpected response to handshake".to_string(),
            ));
        }
    };
    shared
        .check_hello(&hello, &[nonce.as_str(), hello.nonce.as_str()])
        .map_err(|(_, e)| e)?;
    let session = match exchange {
        Some(exchange) => Some(exchange.finish(
            &hello.exchange_key,
            Role::Initiator,
            &session_transcript(&ours, &hello),
        )?),
        None => None,
    };

    let initiator = shared.node_id.clone();
    establish(Arc::clone(shared), reader, writer, addr, hello, initiator, session);
    Ok(())
}

/// What both ends of a handshake saw, in initiator-then-responder order.
fn session_transcript(initiator: &PeerHello, responder: &PeerHello) -> Vec<u8> {
    [
        initiator.node_id.as_str(),
        initiator.nonce.as_str(),
        initiator.exchange_key.as_str(),
        responder.node_id.as_str(),
        responder.nonce.as_str(),
        responder.exchange_key.as_str(),
    ]
    .join("|")
    .into_bytes()
}

/// Handle a single inbound connection: verify the handshake, then link.
async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), WireError> {
    let (mut reader, mut writer) = stream.into_split();

    let msg = read_message(&mut reader).await?;
    let hello = match msg.kind {
        WireMessageKind::Request(WireRequest::Handshake(hello)) => hello,
        // Anything before a completed handshake is refused.
        _ => {
            warn!(%addr, "Rejected message before handshake");
            let err_resp = WireMessage {
                id: msg.id,
                kind: WireMessageKind::Response(WireResponse::Error {
                    code: 401,
                    message: "Authentication required: complete handshake first".to_string(),
                }),
            };
            write_message(&mut writer, &err_resp).await?;
            return Err(WireError::HandshakeFailed(
                "Rejected request before handshake".into(),
            ));
        }
    };

    if let Err((code, e)) = shared.check_hello(&hello, &[hello.nonce.as_str()]) {
        warn!(%addr, peer = %hello.node_id, error = %e, "Rejected handshake");
        let err_resp = WireMessage {
            id: msg.id,
            kind: WireMessageKind::Response(WireResponse::Error {
                code,
                message: e.to_string(),
            }),
        };
        write_message(&mut writer, &err_resp).await?;
        return Err(e);
    }

    let ack_nonce = uuid::Uuid::new_v4().to_string();
    let exchange = shared.key_exchange();
    let ours = shared.hello(&[hello.nonce.as_str(), ack_nonce.as_str()], exchange.as_ref());
    let session = match exchange {
        Some(exchange) => {
            let transcript = session_transcript(&hello, &ours);
            match exchange.finish(&hello.exchange_key, Role::Responder, &transcript) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(%addr, peer = %hello.node_id, error = %e, "Rejected handshake");
                    let err_resp = WireMessage {
                        id: msg.id,
                        kind: WireMessageKind::Response(WireResponse::Error {
                            code: 403,
                            message: e.to_string(),
                        }),
                    };
                    write_message(&mut writer, &err_resp).await?;
                    return Err(e);
                }
            }
        }
        None => None,
    };
    let ack = WireMessage {
        id: msg.id,
        kind: WireMessageKind::Response(WireResponse::HandshakeAck(ours)),
    };
    write_message(&mut writer, &ack).await?;

    let initiator = hello.node_id.clone();
    establish(shared, reader, writer, addr, hello, initiator, session);
    Ok(())
}

/// Register a handshaken link and spawn its reader and writer tasks.
fn establish(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    addr: SocketAddr,
    hello: PeerHello,
    initiator: String,
    session: Option<Session>,
) {
    let (mut sealer, mut opener) = match session {
        Some(Session { sealer, opener }) => (Some(sealer), Some(opener)),
        None => (None, None),
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    let close = Arc::new(Notify::new());
    let link = PeerLink {
        id: shared.next_link.fetch_add(1, Ordering::Relaxed),
        initiator,
        tx,
        close: Arc::clone(&close),
    };
    let now = chrono::Utc::now();
    let entry = PeerEntry {
        node_id: hello.node_id.clone(),
        node_name: hello.node_name.clone(),
        endpoint: hello.endpoint.clone(),
        address: addr,
        headers: hello.headers.clone(),
        channels: hello.channels.iter().cloned().collect(),
        public_key: (!hello.public_key.is_empty()).then(|| hello.public_key.clone()),
        protocol_version: hello.protocol_version,
        connected_at: now,
        last_seen: now,
        link: link.clone(),
    };

    let is_new = match shared.registry.insert_link(entry, &shared.node_id) {
        LinkOutcome::New => true,
        LinkOutcome::Replaced(old) => {
            debug!(peer = %hello.node_id, "Replacing duplicate link");
            old.close();
            false
        }
        LinkOutcome::Rejected => {
            debug!(peer = %hello.node_id, "Dropping duplicate link");
            return;
        }
    };

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_link_message(&mut writer, &msg, sealer.as_mut()).await {
                debug!(error = %e, "Link write failed");
                break;
            }
        }
    });

    // Re-announce our channels; one may have been joined during the handshake.
    let ours: Vec<String> = shared
        .channels
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    for channel in ours {
        link.send(WireMessage::notification(WireNotification::Join { channel }));
    }

    if is_new {
        info!(
            peer = %hello.node_id,
            name = %hello.node_name,
            endpoint = %hello.endpoint,
            "Peer linked"
        );
        shared.emit(TransportEvent::PeerEntered(PeerInfo {
            id: hello.node_id.clone(),
            name: hello.node_name.clone(),
            endpoint: hello.endpoint.clone(),
            headers: hello.headers.clone(),
        }));
    }

    if shared.gossip {
        let peers: Vec<GossipPeer> = shared
            .registry
            .all_peers()
            .into_iter()
            .filter(|p| p.node_id != hello.node_id && !p.endpoint.is_empty())
            .map(|p| GossipPeer {
                node_id: p.node_id,
                endpoint: p.endpoint,
            })
            .collect();
        if !peers.is_empty() {
            link.send(WireMessage::notification(WireNotification::Gossip { peers }));
        }
    }

    let node_id = hello.node_id;
    tokio::spawn(async move {
        let result = tokio::select! {
            r = connection_loop(&mut reader, opener.as_mut(), &node_id, &link, &shared) => r,
            _ = close.notified() => Ok(()),
        };
        if let Err(e) = result {
            debug!(peer = %node_id, error = %e, "Link ended");
        }
        if shared.registry.remove_link(&node_id, link.id).is_some()
            && !shared.stopped.load(Ordering::Acquire)
        {
            info!(peer = %node_id, "Peer exited");
            shared.emit(TransportEvent::PeerExited { peer_id: node_id });
        }
    });
}

/// Read loop for an established link.
async fn connection_loop(
    reader: &mut OwnedReadHalf,
    mut opener: Option<&mut FrameOpener>,
    peer_id: &str,
    link: &PeerLink,
    shared: &Arc<Shared>,
) -> Result<(), WireError> {
    loop {
        let msg = match read_link_message(reader, opener.as_deref_mut()).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        shared.registry.touch(peer_id);

        match msg.kind {
            WireMessageKind::Notification(notif) => {
                if !handle_notification(peer_id, notif, shared) {
                    return Ok(());
                }
            }
            WireMessageKind::Request(WireRequest::Ping) => {
                link.send(WireMessage {
                    id: msg.id,
                    kind: WireMessageKind::Response(WireResponse::Pong),
                });
            }
            WireMessageKind::Request(WireRequest::Handshake(_)) => {
                link.send(WireMessage {
                    id: msg.id,
                    kind: WireMessageKind::Response(WireResponse::Error {
                        code: 400,
                        message: "Already handshaked".to_string(),
                    }),
                });
            }
            WireMessageKind::Response(WireResponse::Pong) => {}
            WireMessageKind::Response(other) => {
                warn!(peer = %peer_id, response = ?other, "Unexpected response");
            }
        }
    }
}

/// Process an incoming notification. Returns false when the peer is leaving.
fn handle_notification(peer_id: &str, notif: WireNotification, shared: &Arc<Shared>) -> bool {
    match notif {
        WireNotification::Join { channel } => shared.registry.join(peer_id, &channel),
        WireNotification::Leave { channel } => shared.registry.leave(peer_id, &channel),
        WireNotification::Shout { channel, payload } => {
            let joined = shared
                .channels
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&channel);
            if joined {
                shared.emit(TransportEvent::Shout {
                    peer_id: peer_id.to_string(),
                    channel,
                    payload,
                });
            }
        }
        WireNotification::Whisper { payload } => {
            shared.emit(TransportEvent::Whisper {
                peer_id: peer_id.to_string(),
                payload,
            });
        }
        WireNotification::Gossip { peers } => {
            for peer in peers {
                if peer.node_id != shared.node_id && !shared.registry.contains(&peer.node_id) {
                    spawn_dial(Arc::clone(shared), peer.endpoint);
                }
            }
        }
        WireNotification::ShuttingDown => {
            info!(peer = %peer_id, "Peer is shutting down");
            return false;
        }
    }
    true
}

/// Ping peers and expire silent ones.
async fn heartbeat_loop(shared: Arc<Shared>, config: HeartbeatConfig) {
    let mut ticker = tokio::time::interval(config.check_interval);
    loop {
        ticker.tick().await;
        for status in heartbeat::check_peers(&shared.registry, &config) {
            if status.unresponsive {
                if let Some(peer) = shared.registry.remove_peer(&status.node_id) {
                    peer.link.close();
                    shared.emit(TransportEvent::PeerExited {
                        peer_id: status.node_id,
                    });
                }
                continue;
            }
            if let Some(link) = shared.registry.link(&status.node_id) {
                link.send(WireMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: WireMessageKind::Request(WireRequest::Ping),
                });
            }
        }
    }
}

/// Write a framed message (4-byte length + JSON) to a TCP stream.
pub async fn write_message(
    writer: &mut OwnedWriteHalf,
    msg: &WireMessage,
) -> Result<(), WireError> {
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a frame on an established link, sealing the body when secured.
async fn write_link_message(
    writer: &mut OwnedWriteHalf,
    msg: &WireMessage,
    sealer: Option<&mut FrameSealer>,
) -> Result<(), WireError> {
    let Some(sealer) = sealer else {
        return write_message(writer, msg).await;
    };
    let body = sealer.seal(&serde_json::to_vec(msg)?)?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::MessageTooLarge {
        size: u32::MAX,
        max: MAX_MESSAGE_SIZE,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON) from a TCP stream.
pub async fn read_message(reader: &mut OwnedReadHalf) -> Result<WireMessage, WireError> {
    let body = read_frame(reader).await?;
    Ok(decode_message(&body)?)
}

/// Read a frame on an established link, opening it when secured.
async fn read_link_message(
    reader: &mut OwnedReadHalf,
    opener: Option<&mut FrameOpener>,
) -> Result<WireMessage, WireError> {
    let body = read_frame(reader).await?;
    let body = match opener {
        Some(opener) => opener.open(&body)?,
        None => body,
    };
    Ok(decode_message(&body)?)
}

/// Read one length-prefixed frame body.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(node_id: &str) -> TcpConfig {
        TcpConfig {
            node_id: node_id.to_string(),
            node_name: format!("{node_id}-name"),
            ..TcpConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:5670").unwrap(),
            "127.0.0.1:5670".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_endpoint("127.0.0.1:5670").is_err());
        assert!(parse_endpoint("tcp://host:abc").is_err());
    }

    #[tokio::test]
    async fn test_connect_and_enter_events() {
        let (a, mut rx_a) = TcpTransport::start(config("node-a")).await.unwrap();
        let (b, mut rx_b) = TcpTransport::start(config("node-b")).await.unwrap();

        b.connect_to(a.endpoint()).await.unwrap();

        match next_event(&mut rx_b).await {
            TransportEvent::PeerEntered(info) => assert_eq!(info.id, "node-a"),
            other => panic!("Expected PeerEntered, got {other:?}"),
        }
        match next_event(&mut rx_a).await {
            TransportEvent::PeerEntered(info) => {
                assert_eq!(info.id, "node-b");
                assert_eq!(info.name, "node-b-name");
            }
            other => panic!("Expected PeerEntered, got {other:?}"),
        }
        assert_eq!(b.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_shout_and_whisper() {
        let (a, mut rx_a) = TcpTransport::start(config("node-a")).await.unwrap();
        let (b, mut rx_b) = TcpTransport::start(config("node-b")).await.unwrap();
        a.join("chat").unwrap();
        b.connect_to(a.endpoint()).await.unwrap();
        next_event(&mut rx_a).await;
        next_event(&mut rx_b).await;

        b.shout("chat", b"hello".to_vec()).unwrap();
        match next_event(&mut rx_a).await {
            TransportEvent::Shout { peer_id, channel, payload } => {
                assert_eq!(peer_id, "node-b");
                assert_eq!(channel, "chat");
                assert_eq!(payload, b"hello");
            }
            other => panic!("Expected Shout, got {other:?}"),
        }

        a.whisper("node-b", b"psst".to_vec()).unwrap();
        match next_event(&mut rx_b).await {
            TransportEvent::Whisper { peer_id, payload } => {
                assert_eq!(peer_id, "node-a");
                assert_eq!(payload, b"psst");
            }
            other => panic!("Expected Whisper, got {other:?}"),
        }
        assert!(matches!(
            a.whisper("nobody", vec![]),
            Err(WireError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_peer() {
        let (a, mut rx_a) = TcpTransport::start(config("node-a")).await.unwrap();
        let (b, mut rx_b) = TcpTransport::start(config("node-b")).await.unwrap();
        b.connect_to(a.endpoint()).await.unwrap();
        next_event(&mut rx_a).await;
        next_event(&mut rx_b).await;

        b.shutdown();
        assert_eq!(
            next_event(&mut rx_a).await,
            TransportEvent::PeerExited {
                peer_id: "node-b".to_string()
            }
        );
        assert!(matches!(b.shout("x", vec![]), Err(WireError::Shutdown)));
    }

    #[tokio::test]
    async fn test_secured_handshake() {
        let mut ca = config("node-a");
        ca.identity = Some(Arc::new(Identity::ephemeral()));
        let mut cb = config("node-b");
        cb.identity = Some(Arc::new(Identity::ephemeral()));
        let (a, mut rx_a) = TcpTransport::start(ca).await.unwrap();
        let (b, _rx_b) = TcpTransport::start(cb).await.unwrap();

        b.connect_to(a.endpoint()).await.unwrap();
        assert!(matches!(
            next_event(&mut rx_a).await,
            TransportEvent::PeerEntered(_)
        ));
    }

    #[tokio::test]
    async fn test_secured_link_carries_traffic() {
        let mut ca = config("node-a");
        ca.identity = Some(Arc::new(Identity::ephemeral()));
        let mut cb = config("node-b");
        cb.identity = Some(Arc::new(Identity::ephemeral()));
        let (a, mut rx_a) = TcpTransport::start(ca).await.unwrap();
        let (b, mut rx_b) = TcpTransport::start(cb).await.unwrap();
        a.join("chat").unwrap();
        b.connect_to(a.endpoint()).await.unwrap();
        next_event(&mut rx_a).await;
        next_event(&mut rx_b).await;

        b.shout("chat", b"sealed hello".to_vec()).unwrap();
        match next_event(&mut rx_a).await {
            TransportEvent::Shout { payload, .. } => assert_eq!(payload, b"sealed hello"),
            other => panic!("Expected Shout, got {other:?}"),
        }
        a.whisper("node-b", b"sealed reply".to_vec()).unwrap();
        match next_event(&mut rx_b).await {
            TransportEvent::Whisper { payload, .. } => assert_eq!(payload, b"sealed reply"),
            other => panic!("Expected Whisper, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_secured_frames_are_not_plain_json() {
        let mut ca = config("node-a");
        ca.identity = Some(Arc::new(Identity::ephemeral()));
        let (a, _rx_a) = TcpTransport::start(ca).await.unwrap();
        a.join("chat").unwrap();

        // Handshake by hand, then look at the first frame on the wire.
        let me = Identity::ephemeral();
        let exchange = KeyExchange::new();
        let nonce = "raw-nonce".to_string();
        let exchange_key = exchange.public_key_hex();
        let signature = me.sign(&handshake_payload(&[nonce.as_str()], "raw", &exchange_key));
        let hello = PeerHello {
            node_id: "raw".to_string(),
            node_name: "raw".to_string(),
            protocol_version: PROTOCOL_VERSION,
            public_key: me.public_key_hex(),
            nonce,
            signature,
            exchange_key,
            ..Default::default()
        };

        let stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let handshake = WireMessage {
            id: "hs".to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake(hello.clone())),
        };
        write_message(&mut writer, &handshake).await.unwrap();
        let ack = match read_message(&mut reader).await.unwrap().kind {
            WireMessageKind::Response(WireResponse::HandshakeAck(ack)) => ack,
            other => panic!("Expected HandshakeAck, got {other:?}"),
        };
        assert!(!ack.exchange_key.is_empty());
        let mut session = exchange
            .finish(&ack.exchange_key, Role::Initiator, &session_transcript(&hello, &ack))
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert!(decode_message(&frame).is_err());
        assert!(!frame.windows(b"chat".len()).any(|w| w == b"chat"));

        let opened = decode_message(&session.opener.open(&frame).unwrap()).unwrap();
        match opened.kind {
            WireMessageKind::Notification(WireNotification::Join { channel }) => {
                assert_eq!(channel, "chat")
            }
            other => panic!("Expected Join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_security_mismatch_rejected() {
        let mut ca = config("node-a");
        ca.identity = Some(Arc::new(Identity::ephemeral()));
        let (a, _rx_a) = TcpTransport::start(ca).await.unwrap();
        let (b, _rx_b) = TcpTransport::start(config("node-b")).await.unwrap();

        let err = b.connect_to(a.endpoint()).await.unwrap_err();
        assert!(matches!(err, WireError::HandshakeFailed(_)));
        assert_eq!(a.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_request_before_handshake_rejected() {
        let (a, _rx_a) = TcpTransport::start(config("node-a")).await.unwrap();
        let stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let msg = WireMessage {
            id: "ping-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Ping),
        };
        write_message(&mut writer, &msg).await.unwrap();

        let response = read_message(&mut reader).await.unwrap();
        assert_eq!(response.id, "ping-1");
        match response.kind {
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                assert_eq!(code, 401);
                assert!(message.contains("handshake"));
            }
            other => panic!("Expected Error(401), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broker_gossip_links_peers() {
        let mut broker_config = config("node-0");
        broker_config.gossip = true;
        let (broker, _rx_broker) = TcpTransport::start(broker_config).await.unwrap();

        let (a, mut rx_a) = TcpTransport::start(config("node-a")).await.unwrap();
        let (b, mut rx_b) = TcpTransport::start(config("node-b")).await.unwrap();
        a.connect_to(broker.endpoint()).await.unwrap();
        next_event(&mut rx_a).await;
        b.connect_to(broker.endpoint()).await.unwrap();

        // b enters the broker, hears about a, and dials it.
        let mut seen = HashSet::new();
        while seen.len() < 2 {
            if let TransportEvent::PeerEntered(info) = next_event(&mut rx_b).await {
                seen.insert(info.id);
            }
        }
        assert!(seen.contains("node-a"));
        match next_event(&mut rx_a).await {
            TransportEvent::PeerEntered(info) => assert_eq!(info.id, "node-b"),
            other => panic!("Expected PeerEntered, got {other:?}"),
        }
    }
}
