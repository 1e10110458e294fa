//! Kernel: hosts agents and owns the bus worker.
//!
//! A [`Kernel`] is the explicit replacement for a process-wide bus: it owns
//! one worker thread running a current-thread tokio runtime, the transport,
//! the peer and election state shared by its agents, the real-time clock,
//! timers and the network monitor. Every callback of every hosted agent runs
//! on that worker thread.

use crate::agent::{Agent, AgentCore};
use crate::config::load_config;
use crate::election::ElectionCoordinator;
use crate::error::{KernelError, KernelResult};
use crate::event_bus::{Delivered, EventBus};
use crate::monitor::{self, NetworkProbe};
use crate::realtime::RealTime;
use crate::remote::{RemoteAgent, RemoteRegistry};
use crate::scheduler::{Command, Scheduler, StartMode, Target};
use crate::service::DispatchPolicy;
use crate::supervisor::{Supervisor, SupervisorHealth};
use crate::timer::{TimerId, Timers};
use crate::worker::Worker;
use agentbus_types::agent::AgentId;
use agentbus_types::config::{BusConfig, SecurityConfig};
use agentbus_types::definition::validate_name;
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::MonitorEvent;
use agentbus_wire::envelope::is_reserved_channel;
use agentbus_wire::peer::parse_endpoint;
use agentbus_wire::{Identity, LoopbackHub, PeerInfo};
use crossbeam::channel;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Callback fired for every network monitor event.
pub type MonitorObserver = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Peer-level settings, read when the transport starts.
#[derive(Debug, Clone, Default)]
pub(crate) struct NetworkSettings {
    pub peer_name: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub brokers: Vec<String>,
    /// Public keys of brokers added with [`Kernel::broker_add_secure`].
    pub broker_keys: Vec<PathBuf>,
    /// Set when this kernel also acts as a broker.
    pub broker_endpoint: Option<String>,
    pub advertised_endpoint: Option<String>,
    /// Device of the last device start, sampled by the monitor.
    pub device: Option<String>,
    pub security: SecurityConfig,
}

/// State shared by the kernel handle, its agents and the worker.
pub(crate) struct KernelShared {
    pub config: RwLock<BusConfig>,
    pub agents: DashMap<AgentId, Arc<AgentCore>>,
    pub remote: RemoteRegistry,
    pub elections: ElectionCoordinator,
    pub realtime: RealTime,
    pub events: EventBus,
    pub scheduler: Scheduler,
    pub supervisor: Arc<Supervisor>,
    pub timers: Timers,
    /// Handle of the worker runtime.
    pub handle: Handle,
    pub settings: RwLock<NetworkSettings>,
    pub user_channels: RwLock<BTreeSet<String>>,
    pub probe: RwLock<Option<Arc<dyn NetworkProbe>>>,
    pub monitor_observers: Mutex<Vec<MonitorObserver>>,
    pub monitor_start_stop: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    peer_id: RwLock<Option<String>>,
}

impl KernelShared {
    pub fn submit(&self, command: Command) -> BusResult<()> {
        self.scheduler.submit(command)
    }

    pub fn config(&self) -> BusConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn settings(&self) -> NetworkSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        DispatchPolicy {
            warn_on_undefined: config.warn_on_undefined_service,
            log_calls: config.log_include_services,
        }
    }

    pub fn log_data(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .log_include_data
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn require_started(&self) -> BusResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BusError::InvalidState("the kernel is not started".to_string()))
        }
    }

    /// Record the transport coming up (`Some`) or going down (`None`).
    pub fn set_peer(&self, peer_id: Option<String>) {
        self.started.store(peer_id.is_some(), Ordering::Release);
        self.elections.set_local_peer(peer_id.clone());
        *self.peer_id.write().unwrap_or_else(|e| e.into_inner()) = peer_id;
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Name announced to peers: configured, else the first agent name, else a default.
    pub fn peer_name(&self) -> String {
        if let Some(name) = self.settings().peer_name {
            return name;
        }
        self.agents
            .iter()
            .map(|a| a.value().name())
            .min()
            .unwrap_or_else(|| "agentbus".to_string())
    }

    pub fn agent(&self, uuid: AgentId) -> Option<Arc<AgentCore>> {
        self.agents.get(&uuid).map(|a| a.value().clone())
    }

    pub fn active_agents(&self) -> Vec<Arc<AgentCore>> {
        self.agents
            .iter()
            .filter(|a| a.value().is_active())
            .map(|a| a.value().clone())
            .collect()
    }

    /// Active local agents addressed by `target` (name or uuid).
    pub fn find_local(&self, target: &str) -> Vec<Arc<AgentCore>> {
        self.active_agents()
            .into_iter()
            .filter(|a| a.info().is_addressed_by(target))
            .collect()
    }

    /// Local and remote agents addressed by `target`. With `peers`, falls back
    /// to peers whose name or id is `target` when no agent matches.
    pub fn resolve(&self, target: &str, peers: bool) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .find_local(target)
            .iter()
            .map(|a| Target::Local(a.uuid()))
            .collect();
        targets.extend(self.remote.find(target).into_iter().map(|a| Target::Remote {
            peer: a.peer_id,
            uuid: a.info.uuid,
        }));
        if targets.is_empty() && peers {
            targets.extend(self.remote.find_peers(target).into_iter().map(|p| Target::Peer(p.id)));
        }
        targets
    }

    pub fn monitor_observers(&self) -> Vec<MonitorObserver> {
        self.monitor_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Build the security identity for a start. Fails when the keys are unusable.
    fn identity(&self) -> BusResult<Option<Arc<Identity>>> {
        let settings = self.settings();
        if !settings.security.enabled {
            if !settings.broker_keys.is_empty() {
                warn!("Secure brokers configured but security is disabled");
            }
            return Ok(None);
        }
        let security_error = |e: agentbus_wire::WireError| {
            error!(fatal = true, error = %e, "Security is misconfigured, refusing to start");
            BusError::Security(e.to_string())
        };
        let mut identity = match &settings.security.private_key {
            Some(key) => Identity::load(key, settings.security.public_keys_dir.as_deref())
                .map_err(security_error)?,
            None => Identity::ephemeral(),
        };
        for key in &settings.broker_keys {
            identity.accept_key_file(key).map_err(security_error)?;
        }
        Ok(Some(Arc::new(identity)))
    }
}

/// The bus kernel.
pub struct Kernel {
    shared: Arc<KernelShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("peer_id", &self.shared.peer_id())
            .field("agents", &self.shared.agents.len())
            .finish()
    }
}

impl Kernel {
    /// Boot a kernel from a config file (default location when `None`).
    pub fn boot(config_path: Option<&Path>) -> KernelResult<Self> {
        Self::new(load_config(config_path))
    }

    /// Boot a kernel and spawn its worker thread.
    pub fn new(config: BusConfig) -> KernelResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| KernelError::BootFailed(format!("cannot build worker runtime: {e}")))?;
        let handle = runtime.handle().clone();

        let capacity = (!config.network.unbounded_queue)
            .then_some(config.network.publish_queue_capacity);
        let (scheduler, commands, notify) = Scheduler::new(capacity);

        let settings = NetworkSettings {
            peer_name: config.peer_name.clone(),
            headers: config.network.headers.clone(),
            security: config.security.clone(),
            ..Default::default()
        };
        let shared = Arc::new(KernelShared {
            monitor_start_stop: AtomicBool::new(config.monitor.start_stop),
            config: RwLock::new(config),
            agents: DashMap::new(),
            remote: RemoteRegistry::new(),
            elections: ElectionCoordinator::new(),
            realtime: RealTime::new(),
            events: EventBus::new(),
            scheduler,
            supervisor: Arc::new(Supervisor::new()),
            timers: Timers::new(),
            handle,
            settings: RwLock::new(settings),
            user_channels: RwLock::new(BTreeSet::new()),
            probe: RwLock::new(None),
            monitor_observers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            started: AtomicBool::new(false),
            peer_id: RwLock::new(None),
        });

        let worker = Worker::new(shared.clone(), commands, notify);
        let thread = std::thread::Builder::new()
            .name("agentbus-worker".to_string())
            .spawn(move || runtime.block_on(worker.run()))
            .map_err(|e| KernelError::BootFailed(format!("cannot spawn worker thread: {e}")))?;

        info!(
            queue = ?capacity,
            "Kernel booted"
        );
        Ok(Self {
            shared,
            worker: Some(thread),
        })
    }

    pub fn config(&self) -> BusConfig {
        self.shared.config()
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Create and activate an agent. Names need not be unique.
    pub fn create_agent(&self, name: &str) -> BusResult<Agent> {
        validate_name(name)?;
        let core = AgentCore::new(Arc::downgrade(&self.shared), name, &self.shared.config());
        self.shared.agents.insert(core.uuid(), core.clone());
        let agent = Agent::from_core(core);
        agent.activate()?;
        info!(agent = %name, uuid = %agent.uuid(), "Agent created");
        Ok(agent)
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.shared
            .agents
            .iter()
            .map(|a| Agent::from_core(a.value().clone()))
            .collect()
    }

    /// A hosted agent by name or uuid, active or not.
    pub fn agent(&self, target: &str) -> Option<Agent> {
        self.shared
            .agents
            .iter()
            .find(|a| a.value().info().is_addressed_by(target))
            .map(|a| Agent::from_core(a.value().clone()))
    }

    /// Deactivate and forget an agent. Existing handles become inert.
    pub fn remove_agent(&self, agent: &Agent) -> BusResult<()> {
        let uuid = agent.uuid();
        if !self.shared.agents.contains_key(&uuid) {
            return Err(BusError::AgentNotFound(uuid.to_string()));
        }
        if agent.is_activated() {
            agent.deactivate()?;
        }
        self.shared.agents.remove(&uuid);
        self.shared.realtime.discard(uuid);
        self.shared.events.unsubscribe_agent(uuid);
        info!(agent = %agent.name(), %uuid, "Agent removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Join an in-process hub.
    pub fn start_loopback(&self, hub: &LoopbackHub) -> KernelResult<()> {
        self.start(StartMode::Loopback(hub.clone()))
    }

    /// Self-discovery with beacons on `port`, from the interface bound at `ip`.
    pub fn start_with_ip(&self, ip: IpAddr, port: u16) -> KernelResult<()> {
        self.start(StartMode::Ip { ip, port })
    }

    /// Self-discovery from the current address of `device`.
    ///
    /// Needs a probe, see [`Kernel::set_network_probe`].
    pub fn start_with_device(&self, device: &str, port: u16) -> KernelResult<()> {
        if self.shared.is_started() {
            return Err(BusError::InvalidState("already started".to_string()).into());
        }
        self.shared
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .device = Some(device.to_string());
        self.start(StartMode::Device {
            device: device.to_string(),
            port,
        })
    }

    /// Broker discovery. `endpoint` is where this kernel is reachable.
    pub fn start_with_brokers(&self, endpoint: &str) -> KernelResult<()> {
        parse_endpoint(endpoint).map_err(|e| BusError::Network(e.to_string()))?;
        self.start(StartMode::Brokers {
            endpoint: endpoint.to_string(),
        })
    }

    fn start(&self, mode: StartMode) -> KernelResult<()> {
        if self.shared.scheduler.on_worker() {
            return Err(BusError::InvalidState(
                "start cannot be called from a bus callback".to_string(),
            )
            .into());
        }
        if self.shared.is_started() {
            return Err(BusError::InvalidState("already started".to_string()).into());
        }
        let identity = self.shared.identity()?;
        let (reply, result) = channel::bounded(1);
        self.shared.submit(Command::Start {
            mode,
            identity,
            reply,
        })?;
        result
            .recv()
            .map_err(|_| KernelError::Bus(BusError::ShuttingDown))?
    }

    /// Leave the network, cancel timers and forget peers and elections.
    ///
    /// Must not be called from a bus callback.
    pub fn stop(&self) -> KernelResult<()> {
        if self.shared.scheduler.on_worker() {
            return Err(BusError::InvalidState(
                "stop cannot be called from a bus callback".to_string(),
            )
            .into());
        }
        let (reply, done) = channel::bounded(1);
        self.shared.submit(Command::Stop { reply })?;
        done.recv()
            .map_err(|_| KernelError::Bus(BusError::ShuttingDown))
    }

    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    /// Transport id while started.
    pub fn peer_id(&self) -> Option<String> {
        self.shared.peer_id()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.remote.peers()
    }

    /// Agents hosted by other peers.
    pub fn remote_agents(&self) -> Vec<RemoteAgent> {
        self.shared.remote.agents()
    }

    // -----------------------------------------------------------------------
    // Network settings, applied at the next start
    // -----------------------------------------------------------------------

    fn edit_settings(
        &self,
        what: &str,
        f: impl FnOnce(&mut NetworkSettings) -> BusResult<()>,
    ) -> BusResult<()> {
        if self.shared.is_started() {
            warn!(setting = what, "Network settings cannot change while started");
            return Err(BusError::InvalidState(format!(
                "{what} must be set before start"
            )));
        }
        f(&mut self.shared.settings.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn set_peer_name(&self, name: &str) -> BusResult<()> {
        validate_name(name)?;
        self.edit_settings("peer name", |s| {
            s.peer_name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn peer_name(&self) -> String {
        self.shared.peer_name()
    }

    pub fn peer_add_header(&self, key: &str, value: &str) -> BusResult<()> {
        validate_name(key)?;
        self.edit_settings("headers", |s| {
            if s.headers.contains_key(key) {
                return Err(BusError::already_exists("header", key));
            }
            s.headers.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn peer_remove_header(&self, key: &str) -> BusResult<()> {
        self.edit_settings("headers", |s| {
            s.headers
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| BusError::not_found("header", key))
        })
    }

    pub fn broker_add(&self, endpoint: &str) -> BusResult<()> {
        parse_endpoint(endpoint).map_err(|e| BusError::Network(e.to_string()))?;
        self.edit_settings("brokers", |s| {
            if s.brokers.iter().any(|b| b == endpoint) {
                return Err(BusError::already_exists("broker", endpoint));
            }
            s.brokers.push(endpoint.to_string());
            Ok(())
        })
    }

    /// Add a broker whose key is accepted even outside the public keys directory.
    pub fn broker_add_secure(&self, endpoint: &str, public_key: &Path) -> BusResult<()> {
        if !self.settings_snapshot().security.enabled {
            return Err(BusError::InvalidState(
                "enable security before adding a secure broker".to_string(),
            ));
        }
        self.broker_add(endpoint)?;
        self.edit_settings("brokers", |s| {
            s.broker_keys.push(public_key.to_path_buf());
            Ok(())
        })
    }

    pub fn clear_brokers(&self) -> BusResult<()> {
        self.edit_settings("brokers", |s| {
            s.brokers.clear();
            s.broker_keys.clear();
            Ok(())
        })
    }

    /// Also act as a broker listening on `endpoint`.
    pub fn broker_enable_with_endpoint(&self, endpoint: &str) -> BusResult<()> {
        parse_endpoint(endpoint).map_err(|e| BusError::Network(e.to_string()))?;
        self.edit_settings("broker endpoint", |s| {
            s.broker_endpoint = Some(endpoint.to_string());
            Ok(())
        })
    }

    /// Endpoint announced to peers instead of the bound one (NAT, containers).
    pub fn broker_set_advertised_endpoint(&self, endpoint: Option<&str>) -> BusResult<()> {
        if let Some(endpoint) = endpoint {
            parse_endpoint(endpoint).map_err(|e| BusError::Network(e.to_string()))?;
        }
        self.edit_settings("advertised endpoint", |s| {
            s.advertised_endpoint = endpoint.map(str::to_string);
            Ok(())
        })
    }

    /// Authenticate peers. Without a private key an ephemeral keypair is used
    /// and any secured peer is accepted.
    pub fn enable_security(
        &self,
        private_key: Option<&Path>,
        public_keys_dir: Option<&Path>,
    ) -> BusResult<()> {
        self.edit_settings("security", |s| {
            s.security = SecurityConfig {
                enabled: true,
                private_key: private_key.map(Path::to_path_buf),
                public_keys_dir: public_keys_dir.map(Path::to_path_buf),
            };
            Ok(())
        })
    }

    pub fn disable_security(&self) -> BusResult<()> {
        self.edit_settings("security", |s| {
            s.security = SecurityConfig::default();
            Ok(())
        })
    }

    fn settings_snapshot(&self) -> NetworkSettings {
        self.shared.settings()
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    pub fn channel_join(&self, channel: &str) -> BusResult<()> {
        if is_reserved_channel(channel) {
            return Err(BusError::InvalidName(format!("channel '{channel}' is reserved")));
        }
        validate_name(channel)?;
        let added = self
            .shared
            .user_channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
        if !added {
            return Err(BusError::already_exists("channel", channel));
        }
        self.shared.submit(Command::Channels)
    }

    pub fn channel_leave(&self, channel: &str) -> BusResult<()> {
        let removed = self
            .shared
            .user_channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
        if !removed {
            return Err(BusError::not_found("channel", channel));
        }
        self.shared.submit(Command::Channels)
    }

    pub fn channels(&self) -> Vec<String> {
        self.shared
            .user_channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Real-time clock
    // -----------------------------------------------------------------------

    /// Microseconds: the manual clock once set, wall-clock time before.
    pub fn rt_time(&self) -> i64 {
        self.shared.realtime.now()
    }

    /// Advance this kernel's manual clock and publish writes held by
    /// synchronous mode. Timestamping stays on from now on.
    ///
    /// `i64::MIN` is the absent-timestamp marker and is rejected.
    pub fn rt_set_time(&self, micros: i64) -> BusResult<()> {
        let pending = self.shared.realtime.set_time(micros)?;
        self.shared.submit(Command::Flush(pending))
    }

    pub fn rt_set_timestamps(&self, enabled: bool) {
        if self.shared.realtime.is_manual() && !enabled {
            warn!("Timestamps stay enabled once the clock was set manually");
        }
        self.shared.realtime.set_timestamps(enabled);
    }

    pub fn rt_timestamps_enabled(&self) -> bool {
        self.shared.realtime.timestamps_enabled()
    }

    /// Hold output publication until the next [`Kernel::rt_set_time`].
    /// Turning it off publishes whatever is held.
    ///
    /// The mode, like the clock, belongs to this kernel: other kernels in the
    /// same process keep publishing on their own schedule.
    pub fn rt_set_synchronous_mode(&self, enabled: bool) -> BusResult<()> {
        let pending = self.shared.realtime.set_synchronous(enabled);
        if enabled {
            return Ok(());
        }
        self.shared.submit(Command::Flush(pending))
    }

    pub fn rt_synchronous_mode(&self) -> bool {
        self.shared.realtime.is_synchronous()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Run `callback` on the worker every `delay`, `times` times (0 forever).
    pub fn timer_start(
        &self,
        delay: Duration,
        times: u32,
        callback: impl Fn(TimerId) + Send + Sync + 'static,
    ) -> TimerId {
        self.shared.timers.start(
            &self.shared.handle,
            delay,
            times,
            self.shared.supervisor.clone(),
            callback,
        )
    }

    pub fn timer_stop(&self, id: TimerId) -> BusResult<()> {
        self.shared.timers.stop(id)
    }

    // -----------------------------------------------------------------------
    // Network monitor
    // -----------------------------------------------------------------------

    /// Probe used to resolve devices. Starts the monitor when the
    /// configuration sets a period.
    pub fn set_network_probe(&self, probe: Arc<dyn NetworkProbe>) -> BusResult<()> {
        *self.shared.probe.write().unwrap_or_else(|e| e.into_inner()) = Some(probe.clone());
        match self.shared.config().monitor.period_ms {
            Some(period) if !self.is_monitor_running() => {
                self.monitor_start(Duration::from_millis(period), probe)
            }
            _ => Ok(()),
        }
    }

    /// Sample the started device every `period`.
    pub fn monitor_start(&self, period: Duration, probe: Arc<dyn NetworkProbe>) -> BusResult<()> {
        *self.shared.probe.write().unwrap_or_else(|e| e.into_inner()) = Some(probe.clone());
        let mut task = self.shared.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(BusError::InvalidState("monitor already running".to_string()));
        }
        let weak = Arc::downgrade(&self.shared);
        let device_of = {
            let weak = weak.clone();
            move || weak.upgrade().and_then(|k| k.settings().device)
        };
        let sink = move |event: MonitorEvent| {
            if let Some(kernel) = weak.upgrade() {
                if let Err(e) = kernel.submit(Command::Monitor(event)) {
                    warn!(error = %e, "Monitor event dropped");
                }
            }
        };
        *task = Some(monitor::spawn(&self.shared.handle, probe, period, device_of, sink));
        info!(?period, "Network monitor started");
        Ok(())
    }

    pub fn monitor_stop(&self) -> BusResult<()> {
        let task = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| BusError::InvalidState("monitor is not running".to_string()))?;
        task.abort();
        info!("Network monitor stopped");
        Ok(())
    }

    pub fn is_monitor_running(&self) -> bool {
        self.shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Suspend the transport when the device disappears and restart it on
    /// the new address.
    pub fn monitor_set_start_stop(&self, enabled: bool) {
        self.shared.monitor_start_stop.store(enabled, Ordering::Relaxed);
    }

    pub fn observe_monitor(&self, observer: impl Fn(&MonitorEvent) + Send + Sync + 'static) {
        self.shared
            .monitor_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Commands waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.shared.scheduler.depth()
    }

    pub fn panic_count(&self) -> u64 {
        self.shared.supervisor.panic_count()
    }

    pub fn health(&self) -> SupervisorHealth {
        self.shared.supervisor.health()
    }

    /// Events of every hosted agent.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Delivered> {
        self.shared.events.subscribe_all()
    }

    /// Most recent events first.
    pub fn event_history(&self, limit: usize) -> Vec<Delivered> {
        self.shared.events.history(limit)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shared.supervisor.shutdown();
        if let Some(task) = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Err(e) = self.shared.submit(Command::Shutdown) {
            warn!(error = %e, "Worker already gone");
        }
        if let Some(worker) = self.worker.take() {
            if self.shared.scheduler.on_worker() {
                return;
            }
            if worker.join().is_err() {
                error!("Bus worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StaticProbe;
    use std::sync::atomic::AtomicUsize;

    fn kernel() -> Kernel {
        Kernel::new(BusConfig::default()).unwrap()
    }

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_create_and_remove_agents() {
        let kernel = kernel();
        let a = kernel.create_agent("alpha").unwrap();
        kernel.create_agent("beta").unwrap();
        assert!(a.is_activated());
        assert_eq!(kernel.agents().len(), 2);
        assert_eq!(kernel.agent("alpha").unwrap().uuid(), a.uuid());
        assert_eq!(kernel.agent(&a.uuid().to_string()).unwrap().name(), "alpha");
        assert_eq!(kernel.peer_name(), "alpha");

        kernel.remove_agent(&a).unwrap();
        assert!(kernel.agent("alpha").is_none());
        assert!(matches!(kernel.remove_agent(&a), Err(BusError::AgentNotFound(_))));
        assert!(kernel.create_agent("").is_err());
    }

    #[test]
    fn test_start_and_stop_loopback() {
        let hub = LoopbackHub::new();
        let kernel = kernel();
        kernel.create_agent("alpha").unwrap();
        kernel.start_loopback(&hub).unwrap();
        assert!(kernel.is_started());
        assert!(kernel.peer_id().is_some());
        assert!(matches!(
            kernel.start_loopback(&hub),
            Err(KernelError::Bus(BusError::InvalidState(_)))
        ));
        assert!(kernel.peer_add_header("site", "lab").is_err());

        kernel.stop().unwrap();
        assert!(!kernel.is_started());
        assert!(kernel.peer_id().is_none());
        assert!(hub.is_empty());
        // Stopping twice is harmless.
        kernel.stop().unwrap();
    }

    #[test]
    fn test_security_misconfiguration_prevents_start() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = agentbus_wire::security::generate_key_files(dir.path(), "me").unwrap();
        let kernel = kernel();
        kernel
            .enable_security(Some(&key), Some(&dir.path().join("missing")))
            .unwrap();
        let err = kernel.start_loopback(&LoopbackHub::new()).unwrap_err();
        assert!(matches!(err, KernelError::Bus(BusError::Security(_))));
        assert!(!kernel.is_started());

        kernel.enable_security(Some(&key), Some(dir.path())).unwrap();
        kernel.start_loopback(&LoopbackHub::new()).unwrap();
    }

    #[test]
    fn test_settings() {
        let kernel = kernel();
        kernel.peer_add_header("site", "lab").unwrap();
        assert!(kernel.peer_add_header("site", "other").is_err());
        kernel.peer_remove_header("site").unwrap();
        assert!(kernel.peer_remove_header("site").is_err());

        kernel.broker_add("tcp://127.0.0.1:5670").unwrap();
        assert!(kernel.broker_add("tcp://127.0.0.1:5670").is_err());
        assert!(kernel.broker_add("udp://nowhere").is_err());
        assert!(kernel
            .broker_add_secure("tcp://127.0.0.1:5671", Path::new("broker.pub"))
            .is_err());
        kernel.clear_brokers().unwrap();
        assert!(kernel.settings_snapshot().brokers.is_empty());

        kernel.set_peer_name("host-a").unwrap();
        assert_eq!(kernel.peer_name(), "host-a");
    }

    #[test]
    fn test_brokers_mode_needs_brokers() {
        let kernel = kernel();
        let err = kernel.start_with_brokers("tcp://127.0.0.1:0").unwrap_err();
        assert!(matches!(err, KernelError::Bus(BusError::InvalidState(_))));
    }

    #[test]
    fn test_user_channels() {
        let kernel = kernel();
        kernel.channel_join("chat").unwrap();
        assert!(kernel.channel_join("chat").is_err());
        assert!(matches!(
            kernel.channel_join("agentbus-private"),
            Err(BusError::InvalidName(_))
        ));
        assert_eq!(kernel.channels(), vec!["chat".to_string()]);
        kernel.channel_leave("chat").unwrap();
        assert!(kernel.channel_leave("chat").is_err());
    }

    #[test]
    fn test_timers_run_on_worker() {
        let kernel = kernel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = kernel.timer_start(Duration::from_millis(5), 3, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        wait_until("three ticks", || hits.load(Ordering::SeqCst) == 3);
        assert!(kernel.timer_stop(id).is_err());
    }

    #[test]
    fn test_manual_clock_forces_timestamps() {
        let kernel = kernel();
        assert!(!kernel.rt_timestamps_enabled());
        assert!(kernel.rt_set_time(i64::MIN).is_err());
        assert!(!kernel.rt_timestamps_enabled());
        kernel.rt_set_time(1_000).unwrap();
        assert_eq!(kernel.rt_time(), 1_000);
        kernel.rt_set_timestamps(false);
        assert!(kernel.rt_timestamps_enabled());
    }

    #[test]
    fn test_monitor_reports_to_observers() {
        let kernel = kernel();
        let probe = Arc::new(StaticProbe::new());
        probe.set("eth0", "10.0.0.1".parse().unwrap());
        kernel
            .shared
            .settings
            .write()
            .unwrap()
            .device = Some("eth0".to_string());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        kernel.observe_monitor(move |e| s.lock().unwrap().push(e.clone()));
        kernel.monitor_start(Duration::from_millis(5), probe.clone()).unwrap();
        assert!(kernel.monitor_start(Duration::from_millis(5), probe.clone()).is_err());

        std::thread::sleep(Duration::from_millis(40));
        probe.set("eth0", "10.0.0.2".parse().unwrap());
        wait_until("address change", || !seen.lock().unwrap().is_empty());
        assert_eq!(
            seen.lock().unwrap()[0],
            MonitorEvent::AddressChanged {
                device: "eth0".into(),
                ip: "10.0.0.2".into()
            }
        );
        kernel.monitor_stop().unwrap();
        assert!(!kernel.is_monitor_running());
    }
}
