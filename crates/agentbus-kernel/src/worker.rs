//! Bus worker: owns the transport and runs every callback.
//!
//! The worker sleeps until either a command arrives from the [`Scheduler`]
//! or the transport delivers an event. Commands are drained in submission
//! order after each wake-up, so writes from one thread reach peers in the
//! order they were made.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use crate::agent::{AgentCore, Flag};
use crate::election::{Outcome, Resolution};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{KernelShared, NetworkSettings};
use crate::realtime::PendingOutput;
use crate::remote::RemoteAgent;
use crate::scheduler::{Announce, Command, StartMode, Target};
use crate::service;
use agentbus_types::agent::{AgentId, AgentInfo};
use agentbus_types::error::BusError;
use agentbus_types::event::{
    AgentEvent, AgentEventKind, ChannelMessage, IoUpdate, MonitorEvent, ServiceCall, NO_TIMESTAMP,
};
use agentbus_types::value::{IoKind, IoValue, ValueType};
use agentbus_wire::envelope::{output_channel, SYSTEM_CHANNEL};
use agentbus_wire::heartbeat::HeartbeatConfig;
use agentbus_wire::peer::parse_endpoint;
use agentbus_wire::{
    AgentSnapshot, Discovery, Envelope, Identity, PeerInfo, TcpConfig, TcpTransport, Transport,
    TransportEvent,
};
use crossbeam::channel::Receiver;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

type Opened = (Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>);

pub(crate) struct Worker {
    shared: Arc<KernelShared>,
    commands: Receiver<Command>,
    notify: Arc<Notify>,
    transport: Option<Box<dyn Transport>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Channels the transport is subscribed to.
    joined: BTreeSet<String>,
    /// Kept while suspended so the monitor can bring the bus back.
    mode: Option<StartMode>,
    identity: Option<Arc<Identity>>,
    suspended: bool,
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<KernelShared>,
        commands: Receiver<Command>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            shared,
            commands,
            notify,
            transport: None,
            events: None,
            joined: BTreeSet::new(),
            mode: None,
            identity: None,
            suspended: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.shared.scheduler.enter_worker();
        debug!("Bus worker running");
        let notify = self.notify.clone();
        loop {
            let event = tokio::select! {
                _ = notify.notified() => None,
                event = next_event(&mut self.events) => Some(event),
            };
            match event {
                Some(Some(event)) => self.on_transport_event(event),
                Some(None) => {
                    debug!("Transport event stream closed");
                    self.events = None;
                }
                None => {}
            }
            if !self.drain().await {
                break;
            }
        }
        self.stop();
        debug!("Bus worker exited");
    }

    /// Run queued commands. Returns false on shutdown.
    async fn drain(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, Command::Shutdown) {
                return false;
            }
            self.handle(command).await;
        }
        true
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                mode,
                identity,
                reply,
            } => {
                let result = self.start(mode, identity).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Written { agent, update } => self.on_written(agent, update),
            Command::Announce { agent, what } => self.on_announce(agent, what),
            Command::Call {
                caller,
                targets,
                service,
                arguments,
                token,
                timestamp,
            } => self.on_call(caller, targets, service, arguments, token, timestamp),
            Command::Election {
                agent,
                election,
                joined,
                resolution,
            } => {
                self.shout(
                    SYSTEM_CHANNEL,
                    &Envelope::Election {
                        election,
                        candidate: agent,
                        joined,
                    },
                );
                if let Some(resolution) = resolution {
                    self.fire_resolution(&resolution);
                }
            }
            Command::Shout {
                agent,
                channel,
                payload,
            } => self.on_shout(agent, channel, payload),
            Command::Whisper {
                agent,
                targets,
                payload,
            } => self.on_whisper(agent, targets, payload),
            Command::RequestStop { agent, targets } => self.on_request_stop(agent, targets),
            Command::Channels => self.sync_channels(),
            Command::Flush(pending) => self.flush(pending),
            Command::Monitor(event) => self.on_monitor(event).await,
            Command::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Transport lifecycle
    // -----------------------------------------------------------------------

    async fn start(
        &mut self,
        mode: StartMode,
        identity: Option<Arc<Identity>>,
    ) -> KernelResult<()> {
        if self.transport.is_some() || self.suspended {
            return Err(BusError::InvalidState("the kernel is already started".to_string()).into());
        }
        let (transport, events) = self.open(&mode, identity.clone()).await?;
        self.install(transport, events);
        self.mode = Some(mode);
        self.identity = identity;
        Ok(())
    }

    async fn open(
        &self,
        mode: &StartMode,
        identity: Option<Arc<Identity>>,
    ) -> KernelResult<Opened> {
        let settings = self.shared.settings();
        match mode {
            StartMode::Loopback(hub) => {
                let (transport, events) =
                    hub.connect(&self.shared.peer_name(), settings.headers.clone());
                Ok((Box::new(transport), events))
            }
            StartMode::Ip { ip, port } => {
                let discovery = Discovery::Beacon { ip: *ip, port: *port };
                self.open_tcp(&settings, SocketAddr::new(*ip, 0), discovery, identity)
                    .await
            }
            StartMode::Device { device, port } => {
                let ip = self.device_address(device).await?;
                let discovery = Discovery::Beacon { ip, port: *port };
                self.open_tcp(&settings, SocketAddr::new(ip, 0), discovery, identity)
                    .await
            }
            StartMode::Brokers { endpoint } => {
                let listen = settings
                    .broker_endpoint
                    .clone()
                    .unwrap_or_else(|| endpoint.clone());
                let brokers: Vec<String> = settings
                    .brokers
                    .iter()
                    .filter(|b| **b != listen)
                    .cloned()
                    .collect();
                if brokers.is_empty() && settings.broker_endpoint.is_none() {
                    return Err(BusError::InvalidState(
                        "no broker to connect to".to_string(),
                    )
                    .into());
                }
                let addr = parse_endpoint(&listen)?;
                self.open_tcp(&settings, addr, Discovery::Brokers(brokers), identity)
                    .await
            }
        }
    }

    async fn open_tcp(
        &self,
        settings: &NetworkSettings,
        listen_addr: SocketAddr,
        discovery: Discovery,
        identity: Option<Arc<Identity>>,
    ) -> KernelResult<Opened> {
        let network = self.shared.config().network;
        let interval = Duration::from_millis(network.discovery_interval_ms.max(1));
        let config = TcpConfig {
            listen_addr,
            advertised_endpoint: settings.advertised_endpoint.clone(),
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: self.shared.peer_name(),
            headers: settings.headers.clone(),
            discovery,
            discovery_interval: interval,
            heartbeat: HeartbeatConfig {
                check_interval: interval,
                peer_timeout: Duration::from_millis(network.peer_timeout_ms),
            },
            gossip: settings.broker_endpoint.is_some(),
            identity,
        };
        let (transport, events) = TcpTransport::start(config).await.map_err(|e| {
            error!(addr = %listen_addr, error = %e, "Transport failed to start");
            KernelError::BootFailed(e.to_string())
        })?;
        Ok((Box::new(transport), events))
    }

    async fn device_address(&self, device: &str) -> KernelResult<IpAddr> {
        let probe = self
            .shared
            .probe
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                BusError::InvalidState("no network probe to resolve devices".to_string())
            })?;
        probe.address_of(device).await.ok_or_else(|| {
            KernelError::Bus(BusError::Network(format!(
                "device '{device}' has no usable address"
            )))
        })
    }

    fn install(&mut self, transport: Box<dyn Transport>, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let peer_id = transport.peer_id().to_string();
        if let Err(e) = transport.join(SYSTEM_CHANNEL) {
            warn!(error = %e, "Cannot join the system channel");
        }
        self.joined = BTreeSet::from([SYSTEM_CHANNEL.to_string()]);
        self.transport = Some(transport);
        self.events = Some(events);
        self.suspended = false;
        self.shared.set_peer(Some(peer_id.clone()));
        self.sync_channels();
        info!(peer = %peer_id, name = %self.shared.peer_name(), "Bus started");
    }

    /// Leave the network but keep local state.
    fn teardown(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        for core in self.shared.active_agents() {
            send(
                transport.as_ref(),
                To::Channel(SYSTEM_CHANNEL),
                &Envelope::AgentExited { uuid: core.uuid() },
            );
        }
        transport.shutdown();
        self.events = None;
        self.joined.clear();
        self.shared.remote.clear();
        self.shared.elections.clear_remote();
        self.shared.set_peer(None);
    }

    fn stop(&mut self) {
        let running = self.transport.is_some() || self.mode.is_some();
        self.teardown();
        self.shared.elections.clear();
        self.shared.timers.stop_all();
        let dropped = self.shared.realtime.drain().len();
        self.mode = None;
        self.identity = None;
        self.suspended = false;
        if running {
            info!(dropped_outputs = dropped, "Bus stopped");
        }
    }

    async fn on_monitor(&mut self, event: MonitorEvent) {
        for observer in self.shared.monitor_observers() {
            self.shared.supervisor.guard("monitor", || observer(&event));
        }
        if !self.shared.monitor_start_stop.load(Ordering::Relaxed) {
            return;
        }
        let Some(StartMode::Device { device, .. }) = self.mode.clone() else {
            return;
        };
        match event {
            MonitorEvent::DeviceNotAvailable { device: gone }
                if gone == device && self.transport.is_some() =>
            {
                warn!(device = %gone, "Network device lost, suspending the bus");
                self.teardown();
                self.suspended = true;
            }
            MonitorEvent::AddressChanged { device: changed, ip } if changed == device => {
                self.restart(&device, ip).await;
            }
            MonitorEvent::NetworkOk { device: back, ip } if back == device && self.suspended => {
                self.restart(&device, ip).await;
            }
            _ => {}
        }
    }

    async fn restart(&mut self, device: &str, ip: String) {
        let Some(mode) = self.mode.clone() else {
            return;
        };
        info!(device, %ip, "Restarting the bus");
        self.teardown();
        match self.open(&mode, self.identity.clone()).await {
            Ok((transport, events)) => {
                self.install(transport, events);
                let event = MonitorEvent::OkAfterManualRestart {
                    device: device.to_string(),
                    ip,
                };
                for observer in self.shared.monitor_observers() {
                    self.shared.supervisor.guard("monitor", || observer(&event));
                }
            }
            Err(e) => {
                error!(device, error = %e, "Restart failed, the bus stays suspended");
                self.suspended = true;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    fn shout(&self, channel: &str, envelope: &Envelope) {
        if let Some(transport) = &self.transport {
            send(transport.as_ref(), To::Channel(channel), envelope);
        }
    }

    fn whisper(&self, peer_id: &str, envelope: &Envelope) {
        if let Some(transport) = &self.transport {
            send(transport.as_ref(), To::Peer(peer_id), envelope);
        }
    }

    /// Subscribe to exactly the channels this kernel needs.
    fn sync_channels(&mut self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let mut wanted = BTreeSet::from([SYSTEM_CHANNEL.to_string()]);
        wanted.extend(
            self.shared
                .user_channels
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        for core in self.shared.active_agents() {
            wanted.extend(core.mapping.referenced_agents().iter().map(|a| output_channel(a)));
        }
        for channel in wanted.difference(&self.joined) {
            if let Err(e) = transport.join(channel) {
                warn!(channel = %channel, error = %e, "Cannot join channel");
            }
        }
        for channel in self.joined.difference(&wanted) {
            if let Err(e) = transport.leave(channel) {
                debug!(channel = %channel, error = %e, "Cannot leave channel");
            }
        }
        self.joined = wanted;
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    fn on_written(&mut self, agent: AgentId, update: IoUpdate) {
        let Some(core) = self.shared.agent(agent) else {
            return;
        };
        if self.shared.log_data() {
            debug!(agent = %core.name(), kind = %update.kind, io = %update.name, value = ?update.value, "IO written");
        }
        self.shared
            .supervisor
            .guard("io observer", || core.store.notify(&update));
        if update.kind != IoKind::Output {
            return;
        }
        if !self.shared.is_started()
            || !core.is_active()
            || !core.publishes()
            || core.store.is_output_muted(&update.name)
        {
            trace!(agent = %core.name(), output = %update.name, "Output not published");
            return;
        }
        if self.shared.realtime.is_synchronous() {
            self.shared.realtime.buffer(agent, update);
            return;
        }
        self.publish(&core, update);
    }

    fn flush(&mut self, mut pending: Vec<PendingOutput>) {
        pending.extend(self.shared.realtime.drain());
        if pending.is_empty() {
            return;
        }
        let stamp = self.shared.realtime.stamp();
        debug!(count = pending.len(), "Publishing buffered outputs");
        for PendingOutput { agent, mut update } in pending {
            let Some(core) = self.shared.agent(agent) else {
                continue;
            };
            if !self.shared.is_started() || !core.is_active() || !core.publishes() {
                continue;
            }
            update.timestamp = stamp;
            self.publish(&core, update);
        }
    }

    /// Send an output to the peers listening for it and to local mappings.
    fn publish(&self, core: &AgentCore, update: IoUpdate) {
        let agent_name = core.name();
        let value = update.value.unwrap_or(IoValue::Impulsion);
        if self.shared.log_data() {
            debug!(agent = %agent_name, output = %update.name, value = %value.summary(), "Publishing output");
        }
        self.shout(
            &output_channel(&agent_name),
            &Envelope::Output {
                uuid: core.uuid(),
                agent_name: agent_name.clone(),
                name: update.name.clone(),
                value: value.clone(),
                timestamp: (update.timestamp != NO_TIMESTAMP).then_some(update.timestamp),
            },
        );
        self.route(&agent_name, &update.name, value, update.timestamp);
    }

    /// Write an output value into every local input mapped to it.
    fn route(&self, source: &str, output: &str, value: IoValue, timestamp: i64) {
        for core in self.shared.active_agents() {
            for input in core.mapping.route(source, output) {
                match core.store.apply(IoKind::Input, &input, value.clone(), timestamp) {
                    Ok(update) => {
                        self.shared
                            .supervisor
                            .guard("io observer", || core.store.notify(&update));
                    }
                    Err(BusError::Frozen(_)) => {
                        trace!(agent = %core.name(), input = %input, "Frozen agent ignored mapped value");
                    }
                    Err(e) => {
                        warn!(agent = %core.name(), input = %input, source, output, error = %e, "Mapped value rejected");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Announcements
    // -----------------------------------------------------------------------

    fn on_announce(&mut self, agent: AgentId, what: Announce) {
        if let Announce::Deactivated(info) = what {
            self.on_deactivated(info);
            return;
        }
        let Some(core) = self.shared.agent(agent) else {
            return;
        };
        let active = core.is_active();
        match what {
            Announce::Definition if active => self.shout(
                SYSTEM_CHANNEL,
                &Envelope::DefinitionUpdated {
                    uuid: agent,
                    definition: core.store.snapshot(),
                },
            ),
            Announce::Mapping => {
                if active {
                    self.shout(
                        SYSTEM_CHANNEL,
                        &Envelope::MappingUpdated {
                            uuid: agent,
                            mapping: core.mapping.table(),
                        },
                    );
                    self.request_outputs(&core, &self.shared.remote.agents());
                }
                self.sync_channels();
            }
            Announce::Info if active => self.shout(
                SYSTEM_CHANNEL,
                &Envelope::AgentUpdated { info: core.info() },
            ),
            Announce::Muted(value) | Announce::Frozen(value) => {
                let flag = if matches!(what, Announce::Muted(_)) {
                    Flag::Muted
                } else {
                    Flag::Frozen
                };
                core.fire_flag(&self.shared, flag, value);
                if active {
                    self.shout(
                        SYSTEM_CHANNEL,
                        &Envelope::AgentUpdated { info: core.info() },
                    );
                }
            }
            Announce::Activated => self.on_activated(&core),
            _ => {}
        }
    }

    fn on_activated(&mut self, core: &Arc<AgentCore>) {
        let info = core.info();
        info!(agent = %info.name, uuid = %info.uuid, "Agent activated");
        for other in self.shared.active_agents() {
            if other.uuid() == info.uuid {
                continue;
            }
            other.emit(
                &self.shared,
                AgentEvent::new(AgentEventKind::AgentEntered, Some(info.uuid), &info.name),
            );
            core.emit(
                &self.shared,
                AgentEvent::new(AgentEventKind::AgentEntered, Some(other.uuid()), other.name()),
            );
        }
        let remote = self.shared.remote.agents();
        for agent in &remote {
            core.emit(
                &self.shared,
                AgentEvent::new(
                    AgentEventKind::AgentEntered,
                    Some(agent.info.uuid),
                    &agent.info.name,
                ),
            );
        }
        self.shout(
            SYSTEM_CHANNEL,
            &Envelope::AgentEntered {
                agent: core.snapshot(&self.shared),
            },
        );
        self.request_outputs(core, &remote);
        self.sync_channels();
    }

    fn on_deactivated(&mut self, info: AgentInfo) {
        info!(agent = %info.name, uuid = %info.uuid, "Agent deactivated");
        self.shout(SYSTEM_CHANNEL, &Envelope::AgentExited { uuid: info.uuid });
        self.emit_all(AgentEvent::new(
            AgentEventKind::AgentExited,
            Some(info.uuid),
            &info.name,
        ));
        self.shared.realtime.discard(info.uuid);
        self.sync_channels();
    }

    /// Ask the sources `core` maps from for their current outputs.
    fn request_outputs(&self, core: &AgentCore, sources: &[RemoteAgent]) {
        if !core.mapping.outputs_request() {
            return;
        }
        for source in sources {
            if core.mapping.references_agent(&source.info.name) {
                debug!(agent = %core.name(), source = %source.info.name, "Requesting current outputs");
                self.whisper(
                    &source.peer_id,
                    &Envelope::OutputsRequest {
                        requester: core.uuid(),
                        target: source.info.uuid,
                    },
                );
            }
        }
    }

    fn emit_all(&self, event: AgentEvent) {
        for core in self.shared.active_agents() {
            if Some(core.uuid()) == event.uuid {
                continue;
            }
            core.emit(&self.shared, event.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Services, elections, channels
    // -----------------------------------------------------------------------

    fn on_call(
        &self,
        caller: AgentId,
        targets: Vec<Target>,
        service: String,
        arguments: Vec<IoValue>,
        token: Option<String>,
        timestamp: i64,
    ) {
        let Some(core) = self.shared.agent(caller) else {
            return;
        };
        let caller_name = core.name();
        for target in targets {
            match target {
                Target::Local(uuid) => self.deliver_call(
                    uuid,
                    &ServiceCall {
                        sender_name: caller_name.clone(),
                        sender_uuid: caller,
                        service: service.clone(),
                        arguments: arguments.clone(),
                        token: token.clone(),
                        timestamp,
                    },
                ),
                Target::Remote { peer, uuid } => self.whisper(
                    &peer,
                    &Envelope::ServiceCall {
                        caller,
                        caller_name: caller_name.clone(),
                        target: uuid,
                        service: service.clone(),
                        arguments: arguments.clone(),
                        token: token.clone(),
                        timestamp: (timestamp != NO_TIMESTAMP).then_some(timestamp),
                    },
                ),
                Target::Peer(_) => {}
            }
        }
    }

    fn deliver_call(&self, target: AgentId, call: &ServiceCall) {
        let Some(core) = self.shared.agent(target).filter(|c| c.is_active()) else {
            debug!(%target, service = %call.service, "Call to an inactive agent dropped");
            return;
        };
        service::dispatch(
            &core.store,
            &core.name(),
            call,
            self.shared.dispatch_policy(),
            &self.shared.supervisor,
        );
    }

    fn fire_resolution(&self, resolution: &Resolution) {
        let kind = match resolution.outcome {
            Outcome::Won => AgentEventKind::AgentWonElection,
            Outcome::Lost => AgentEventKind::AgentLostElection,
        };
        for uuid in &resolution.agents {
            let Some(core) = self.shared.agent(*uuid) else {
                continue;
            };
            info!(agent = %core.name(), election = %resolution.election, outcome = ?resolution.outcome, "Election resolved");
            core.emit(
                &self.shared,
                AgentEvent::new(kind, Some(*uuid), core.name()).with_data(resolution.election.clone()),
            );
        }
    }

    fn on_shout(&self, agent: AgentId, channel: String, payload: Vec<u8>) {
        let Some(core) = self.shared.agent(agent) else {
            return;
        };
        let sender_name = core.name();
        self.shout(
            &channel,
            &Envelope::Channel {
                sender: agent,
                sender_name: sender_name.clone(),
                channel: Some(channel.clone()),
                target: None,
                payload: payload.clone(),
            },
        );
        if self.joined.contains(&channel) {
            let message = ChannelMessage {
                sender_name,
                sender_uuid: agent,
                channel: Some(channel),
                payload,
            };
            for other in self.shared.active_agents() {
                if other.uuid() != agent {
                    other.fire_channel(&self.shared, &message);
                }
            }
        }
    }

    fn on_whisper(&self, agent: AgentId, targets: Vec<Target>, payload: Vec<u8>) {
        let Some(core) = self.shared.agent(agent) else {
            return;
        };
        let sender_name = core.name();
        for target in targets {
            match target {
                Target::Local(uuid) => {
                    if let Some(receiver) = self.shared.agent(uuid) {
                        receiver.fire_channel(
                            &self.shared,
                            &ChannelMessage {
                                sender_name: sender_name.clone(),
                                sender_uuid: agent,
                                channel: None,
                                payload: payload.clone(),
                            },
                        );
                    }
                }
                Target::Remote { peer, uuid } => self.whisper(
                    &peer,
                    &Envelope::Channel {
                        sender: agent,
                        sender_name: sender_name.clone(),
                        channel: None,
                        target: Some(uuid),
                        payload: payload.clone(),
                    },
                ),
                Target::Peer(peer) => self.whisper(
                    &peer,
                    &Envelope::Channel {
                        sender: agent,
                        sender_name: sender_name.clone(),
                        channel: None,
                        target: None,
                        payload: payload.clone(),
                    },
                ),
            }
        }
    }

    fn on_request_stop(&self, agent: AgentId, targets: Vec<Target>) {
        let Some(core) = self.shared.agent(agent) else {
            return;
        };
        let sender_name = core.name();
        for target in targets {
            match target {
                Target::Local(uuid) => {
                    if let Some(receiver) = self.shared.agent(uuid) {
                        warn!(agent = %receiver.name(), by = %sender_name, "Forced stop requested");
                        receiver.fire_forced_stop(&self.shared, &sender_name);
                    }
                }
                Target::Remote { peer, uuid } => self.whisper(
                    &peer,
                    &Envelope::Stop {
                        sender_name: sender_name.clone(),
                        target: uuid,
                    },
                ),
                Target::Peer(_) => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerEntered(peer) => self.on_peer_entered(peer),
            TransportEvent::PeerExited { peer_id } => self.on_peer_exited(&peer_id),
            TransportEvent::Shout {
                peer_id, payload, ..
            }
            | TransportEvent::Whisper { peer_id, payload } => self.on_envelope(&peer_id, &payload),
        }
    }

    fn on_peer_entered(&mut self, peer: PeerInfo) {
        if !self.shared.remote.add_peer(peer.clone()) {
            return;
        }
        info!(peer = %peer.id, name = %peer.name, endpoint = %peer.endpoint, "Peer entered");
        self.emit_all(
            AgentEvent::new(AgentEventKind::PeerEntered, None, &peer.name).with_data(peer.id.clone()),
        );
        let agents = self
            .shared
            .active_agents()
            .iter()
            .map(|core| core.snapshot(&self.shared))
            .collect();
        self.whisper(&peer.id, &Envelope::Hello { agents });
    }

    fn on_peer_exited(&mut self, peer_id: &str) {
        let Some((peer, agents)) = self.shared.remote.remove_peer(peer_id) else {
            return;
        };
        info!(peer = %peer.id, name = %peer.name, agents = agents.len(), "Peer exited");
        for agent in &agents {
            self.emit_all(AgentEvent::new(
                AgentEventKind::AgentExited,
                Some(agent.info.uuid),
                &agent.info.name,
            ));
        }
        for resolution in self.shared.elections.peer_exited(peer_id) {
            self.fire_resolution(&resolution);
        }
        self.emit_all(
            AgentEvent::new(AgentEventKind::PeerExited, None, &peer.name).with_data(peer.id.clone()),
        );
    }

    fn on_envelope(&mut self, peer_id: &str, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = peer_id, error = %e, "Undecodable message dropped");
                return;
            }
        };
        trace!(peer = peer_id, kind = envelope.label(), "Message received");
        match envelope {
            Envelope::Hello { agents } => {
                let known: Vec<AgentId> = agents.iter().map(|a| a.info.uuid).collect();
                for agent in agents {
                    self.on_agent_entered(peer_id, agent);
                }
                self.acknowledge(peer_id, known);
            }
            Envelope::AgentEntered { agent } => {
                let uuid = agent.info.uuid;
                self.on_agent_entered(peer_id, agent);
                self.acknowledge(peer_id, vec![uuid]);
            }
            Envelope::AgentExited { uuid } => self.on_agent_exited(peer_id, uuid),
            Envelope::AgentUpdated { info } => {
                let uuid = info.uuid;
                if !self.shared.remote.update(uuid, |a| a.info = info) {
                    debug!(%uuid, "Update for an unknown agent ignored");
                }
            }
            Envelope::DefinitionUpdated { uuid, definition } => {
                if self.shared.remote.update(uuid, |a| a.definition = definition) {
                    self.emit_remote(AgentEventKind::AgentUpdatedDefinition, uuid);
                }
            }
            Envelope::MappingUpdated { uuid, mapping } => {
                if self.shared.remote.update(uuid, |a| a.mapping = mapping) {
                    self.emit_remote(AgentEventKind::AgentUpdatedMapping, uuid);
                }
            }
            Envelope::Known { knowers, known } => {
                for uuid in known {
                    let Some(core) = self.shared.agent(uuid).filter(|c| c.is_active()) else {
                        continue;
                    };
                    for knower in &knowers {
                        core.emit(
                            &self.shared,
                            AgentEvent::new(
                                AgentEventKind::AgentKnowsUs,
                                Some(knower.uuid),
                                &knower.name,
                            ),
                        );
                    }
                }
            }
            Envelope::Output {
                agent_name,
                name,
                value,
                timestamp,
                ..
            } => {
                if self.shared.log_data() {
                    debug!(source = %agent_name, output = %name, value = %value.summary(), "Output received");
                }
                self.route(&agent_name, &name, value, timestamp.unwrap_or(NO_TIMESTAMP));
            }
            Envelope::OutputsRequest { target, .. } => self.answer_outputs_request(peer_id, target),
            Envelope::ServiceCall {
                caller,
                caller_name,
                target,
                service,
                arguments,
                token,
                timestamp,
            } => self.deliver_call(
                target,
                &ServiceCall {
                    sender_name: caller_name,
                    sender_uuid: caller,
                    service,
                    arguments,
                    token,
                    timestamp: timestamp.unwrap_or(NO_TIMESTAMP),
                },
            ),
            Envelope::Election {
                election,
                candidate,
                joined,
            } => {
                let resolution = if joined {
                    self.shared.elections.remote_join(peer_id, &election, candidate)
                } else {
                    self.shared.elections.remote_leave(peer_id, &election, candidate)
                };
                if let Some(resolution) = resolution {
                    self.fire_resolution(&resolution);
                }
            }
            Envelope::Channel {
                sender,
                sender_name,
                channel,
                target,
                payload,
            } => {
                let message = ChannelMessage {
                    sender_name,
                    sender_uuid: sender,
                    channel,
                    payload,
                };
                let receivers = match target {
                    Some(uuid) => self.shared.agent(uuid).filter(|c| c.is_active()).into_iter().collect(),
                    None => self.shared.active_agents(),
                };
                for core in receivers {
                    core.fire_channel(&self.shared, &message);
                }
            }
            Envelope::Stop {
                sender_name,
                target,
            } => {
                if let Some(core) = self.shared.agent(target) {
                    warn!(agent = %core.name(), by = %sender_name, peer = peer_id, "Forced stop requested");
                    core.fire_forced_stop(&self.shared, &sender_name);
                }
            }
        }
    }

    fn on_agent_entered(&mut self, peer_id: &str, snapshot: AgentSnapshot) {
        let uuid = snapshot.info.uuid;
        let name = snapshot.info.name.clone();
        let elections = snapshot.elections.clone();
        let has_mapping = !snapshot.mapping.is_empty();
        if self.shared.remote.upsert(peer_id, snapshot).is_none() {
            info!(peer = peer_id, agent = %name, %uuid, "Remote agent entered");
            self.emit_all(AgentEvent::new(AgentEventKind::AgentEntered, Some(uuid), &name));
            self.emit_all(AgentEvent::new(
                AgentEventKind::AgentUpdatedDefinition,
                Some(uuid),
                &name,
            ));
            if has_mapping {
                self.emit_all(AgentEvent::new(
                    AgentEventKind::AgentUpdatedMapping,
                    Some(uuid),
                    &name,
                ));
            }
        }
        for election in &elections {
            if let Some(resolution) = self.shared.elections.remote_join(peer_id, election, uuid) {
                self.fire_resolution(&resolution);
            }
        }
        if let Some(remote) = self.shared.remote.agent(uuid) {
            for core in self.shared.active_agents() {
                self.request_outputs(&core, std::slice::from_ref(&remote));
            }
        }
    }

    fn on_agent_exited(&mut self, peer_id: &str, uuid: AgentId) {
        let Some(agent) = self.shared.remote.remove_agent(uuid) else {
            return;
        };
        info!(peer = peer_id, agent = %agent.info.name, %uuid, "Remote agent exited");
        self.emit_all(AgentEvent::new(
            AgentEventKind::AgentExited,
            Some(uuid),
            &agent.info.name,
        ));
        for resolution in self.shared.elections.remote_agent_left(peer_id, uuid) {
            self.fire_resolution(&resolution);
        }
    }

    /// Tell `peer_id` which of its agents our agents now know.
    fn acknowledge(&self, peer_id: &str, known: Vec<AgentId>) {
        let knowers: Vec<AgentInfo> = self
            .shared
            .active_agents()
            .iter()
            .map(|core| core.info())
            .collect();
        if knowers.is_empty() || known.is_empty() {
            return;
        }
        self.whisper(peer_id, &Envelope::Known { knowers, known });
    }

    fn emit_remote(&self, kind: AgentEventKind, uuid: AgentId) {
        if let Some(agent) = self.shared.remote.agent(uuid) {
            self.emit_all(AgentEvent::new(kind, Some(uuid), &agent.info.name));
        }
    }

    /// Whisper back the current value of every published output of `target`.
    fn answer_outputs_request(&self, peer_id: &str, target: AgentId) {
        let Some(core) = self.shared.agent(target).filter(|c| c.is_active()) else {
            return;
        };
        if !core.publishes() {
            return;
        }
        let agent_name = core.name();
        let definition = core.store.snapshot();
        for io in definition.ios(IoKind::Output) {
            if io.value_type == ValueType::Impulsion || core.store.is_output_muted(&io.name) {
                continue;
            }
            self.whisper(
                peer_id,
                &Envelope::Output {
                    uuid: target,
                    agent_name: agent_name.clone(),
                    name: io.name.clone(),
                    value: io.value.clone(),
                    timestamp: None,
                },
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum To<'a> {
    Channel(&'a str),
    Peer(&'a str),
}

/// Encode and hand one envelope to the transport.
fn send(transport: &dyn Transport, to: To<'_>, envelope: &Envelope) {
    let bytes = match envelope.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(kind = envelope.label(), error = %e, "Cannot encode message");
            return;
        }
    };
    let result = match to {
        To::Channel(channel) => transport.shout(channel, bytes),
        To::Peer(peer_id) => transport.whisper(peer_id, bytes),
    };
    if let Err(e) = result {
        debug!(kind = envelope.label(), to = ?to, error = %e, "Send failed");
    }
}
