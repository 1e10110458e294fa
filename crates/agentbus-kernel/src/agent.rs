//! Agents: named, addressable endpoints hosted by a kernel.
//!
//! An [`Agent`] is a cheap handle. Its catalog lives in a
//! [`DefinitionStore`], its routing in a [`MappingEngine`]; both report to the
//! agent's core, which hands writes and announcements to the worker.
//!
//! Callbacks registered through the handle receive the agent they belong to
//! and always run on the worker thread.

use crate::definition::{DefinitionStore, StoreListener};
use crate::kernel::KernelShared;
use crate::mapping::{MappingEngine, MappingListener};
use crate::scheduler::{Announce, Command, Target};
use crate::service::check_call;
use agentbus_types::agent::{AgentId, AgentInfo};
use agentbus_types::config::BusConfig;
use agentbus_types::definition::validate_name;
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::{AgentEvent, ChannelMessage, IoUpdate, ServiceCall, NO_TIMESTAMP};
use agentbus_types::value::{IoKind, IoValue, ValueType};
use agentbus_wire::envelope::is_reserved_channel;
use agentbus_wire::AgentSnapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

type FlagObserver = Arc<dyn Fn(&Agent, bool) + Send + Sync>;
type ChannelObserver = Arc<dyn Fn(&Agent, &ChannelMessage) + Send + Sync>;
type StopObserver = Arc<dyn Fn(&Agent, &str) + Send + Sync>;
type EventObserver = Arc<dyn Fn(&Agent, &AgentEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    mute: Vec<FlagObserver>,
    freeze: Vec<FlagObserver>,
    channels: Vec<ChannelObserver>,
    forced_stop: Vec<StopObserver>,
    events: Vec<EventObserver>,
}

/// Which flag observers to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flag {
    Muted,
    Frozen,
}

pub(crate) struct AgentCore {
    kernel: Weak<KernelShared>,
    info: RwLock<AgentInfo>,
    pub(crate) store: Arc<DefinitionStore>,
    pub(crate) mapping: MappingEngine,
    active: AtomicBool,
    observers: Mutex<Observers>,
}

impl AgentCore {
    pub(crate) fn new(kernel: Weak<KernelShared>, name: &str, config: &BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<AgentCore>| {
            let store_listener: Weak<dyn StoreListener> = me.clone();
            let store = Arc::new(DefinitionStore::with_listener(name, store_listener));
            store.set_constraints_enforced(config.constraints_enforce);
            let mapping_listener: Weak<dyn MappingListener> = me.clone();
            let mapping =
                MappingEngine::with_listener(store.clone(), config.outputs_request, mapping_listener);
            Self {
                kernel,
                info: RwLock::new(AgentInfo::new(name)),
                store,
                mapping,
                active: AtomicBool::new(false),
                observers: Mutex::new(Observers::default()),
            }
        })
    }

    pub(crate) fn info(&self) -> AgentInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn uuid(&self) -> AgentId {
        self.info.read().unwrap_or_else(|e| e.into_inner()).uuid
    }

    pub(crate) fn name(&self) -> String {
        self.info.read().unwrap_or_else(|e| e.into_inner()).name.clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Muted or frozen agents publish nothing.
    pub(crate) fn publishes(&self) -> bool {
        let info = self.info.read().unwrap_or_else(|e| e.into_inner());
        !info.muted && !info.frozen
    }

    pub(crate) fn snapshot(&self, kernel: &KernelShared) -> AgentSnapshot {
        AgentSnapshot {
            info: self.info(),
            definition: self.store.snapshot(),
            mapping: self.mapping.table(),
            elections: kernel.elections.elections_of(self.uuid()),
        }
    }

    fn observers<T: Clone>(&self, f: impl FnOnce(&Observers) -> &Vec<T>) -> Vec<T> {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        f(&observers).clone()
    }

    fn announce(&self, what: Announce) {
        let Some(kernel) = self.kernel.upgrade() else { return };
        let agent = self.uuid();
        if let Err(e) = kernel.submit(Command::Announce { agent, what }) {
            warn!(%agent, error = %e, "Announcement dropped");
        }
    }

    /// Deliver an event to this agent's observers and subscribers.
    pub(crate) fn emit(self: &Arc<Self>, kernel: &KernelShared, event: AgentEvent) {
        let agent = Agent::from_core(self.clone());
        for observer in self.observers(|o| &o.events) {
            kernel.supervisor.guard("agent event", || observer(&agent, &event));
        }
        kernel.events.publish(self.uuid(), event);
    }

    pub(crate) fn fire_flag(self: &Arc<Self>, kernel: &KernelShared, flag: Flag, value: bool) {
        let agent = Agent::from_core(self.clone());
        let observers = match flag {
            Flag::Muted => self.observers(|o| &o.mute),
            Flag::Frozen => self.observers(|o| &o.freeze),
        };
        for observer in observers {
            kernel.supervisor.guard("flag", || observer(&agent, value));
        }
    }

    pub(crate) fn fire_channel(self: &Arc<Self>, kernel: &KernelShared, message: &ChannelMessage) {
        let agent = Agent::from_core(self.clone());
        for observer in self.observers(|o| &o.channels) {
            kernel.supervisor.guard("channel", || observer(&agent, message));
        }
    }

    pub(crate) fn fire_forced_stop(self: &Arc<Self>, kernel: &KernelShared, sender: &str) {
        let agent = Agent::from_core(self.clone());
        for observer in self.observers(|o| &o.forced_stop) {
            kernel.supervisor.guard("forced stop", || observer(&agent, sender));
        }
    }
}

impl StoreListener for AgentCore {
    fn timestamp(&self) -> i64 {
        self.kernel
            .upgrade()
            .map(|k| k.realtime.stamp())
            .unwrap_or(NO_TIMESTAMP)
    }

    fn value_written(&self, update: IoUpdate) -> BusResult<()> {
        let kernel = self.kernel.upgrade().ok_or(BusError::ShuttingDown)?;
        kernel.submit(Command::Written {
            agent: self.uuid(),
            update,
        })
    }

    fn definition_changed(&self) {
        self.announce(Announce::Definition);
    }
}

impl MappingListener for AgentCore {
    fn mapping_changed(&self) {
        self.announce(Announce::Mapping);
    }
}

/// Handle to an agent hosted by a [`Kernel`](crate::kernel::Kernel).
#[derive(Clone)]
pub struct Agent {
    core: Arc<AgentCore>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.core.info();
        f.debug_struct("Agent")
            .field("name", &info.name)
            .field("uuid", &info.uuid)
            .field("active", &self.core.is_active())
            .finish()
    }
}

impl PartialEq for Agent {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Agent {
    pub(crate) fn from_core(core: Arc<AgentCore>) -> Self {
        Self { core }
    }

    fn kernel(&self) -> BusResult<Arc<KernelShared>> {
        self.core.kernel.upgrade().ok_or(BusError::ShuttingDown)
    }

    /// Wrap a callback so it receives this agent without keeping it alive.
    fn bind<A: ?Sized + 'static>(
        &self,
        f: impl Fn(&Agent, &A) + Send + Sync + 'static,
    ) -> impl Fn(&A) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.core);
        move |arg: &A| {
            if let Some(core) = weak.upgrade() {
                f(&Agent { core }, arg);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn uuid(&self) -> AgentId {
        self.core.uuid()
    }

    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn info(&self) -> AgentInfo {
        self.core.info()
    }

    pub fn set_name(&self, name: &str) -> BusResult<()> {
        validate_name(name)?;
        self.edit_info(|info| info.name = name.to_string())
    }

    pub fn family(&self) -> String {
        self.core.info().family
    }

    pub fn set_family(&self, family: &str) -> BusResult<()> {
        self.edit_info(|info| info.family = family.to_string())
    }

    pub fn state(&self) -> String {
        self.core.info().state
    }

    pub fn set_state(&self, state: &str) -> BusResult<()> {
        self.edit_info(|info| info.state = state.to_string())
    }

    fn edit_info(&self, f: impl FnOnce(&mut AgentInfo)) -> BusResult<()> {
        f(&mut self.core.info.write().unwrap_or_else(|e| e.into_inner()));
        self.kernel()?.submit(Command::Announce {
            agent: self.uuid(),
            what: Announce::Info,
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Make the agent visible to peers and reachable by the bus.
    pub fn activate(&self) -> BusResult<()> {
        let kernel = self.kernel()?;
        if self.core.active.swap(true, Ordering::AcqRel) {
            return Err(BusError::InvalidState(format!(
                "agent '{}' is already active",
                self.name()
            )));
        }
        kernel.submit(Command::Announce {
            agent: self.uuid(),
            what: Announce::Activated,
        })
    }

    /// Withdraw the agent from the bus. It leaves all its elections.
    pub fn deactivate(&self) -> BusResult<()> {
        let kernel = self.kernel()?;
        if !self.core.active.swap(false, Ordering::AcqRel) {
            return Err(BusError::InvalidState(format!(
                "agent '{}' is not active",
                self.name()
            )));
        }
        let uuid = self.uuid();
        for election in kernel.elections.elections_of(uuid) {
            let resolution = kernel.elections.leave(&election, uuid)?;
            kernel.submit(Command::Election {
                agent: uuid,
                election,
                joined: false,
                resolution,
            })?;
        }
        kernel.submit(Command::Announce {
            agent: uuid,
            what: Announce::Deactivated(self.info()),
        })
    }

    pub fn is_activated(&self) -> bool {
        self.core.is_active()
    }

    // -----------------------------------------------------------------------
    // Mute and freeze
    // -----------------------------------------------------------------------

    /// Stop publishing outputs. Values still update locally.
    pub fn mute(&self) -> BusResult<()> {
        self.set_flag(Flag::Muted, true)
    }

    pub fn unmute(&self) -> BusResult<()> {
        self.set_flag(Flag::Muted, false)
    }

    pub fn is_muted(&self) -> bool {
        self.core.info().muted
    }

    /// Stop publishing and ignore every write to inputs.
    pub fn freeze(&self) -> BusResult<()> {
        self.set_flag(Flag::Frozen, true)
    }

    pub fn unfreeze(&self) -> BusResult<()> {
        self.set_flag(Flag::Frozen, false)
    }

    pub fn is_frozen(&self) -> bool {
        self.core.info().frozen
    }

    fn set_flag(&self, flag: Flag, value: bool) -> BusResult<()> {
        let kernel = self.kernel()?;
        {
            let mut info = self.core.info.write().unwrap_or_else(|e| e.into_inner());
            let slot = match flag {
                Flag::Muted => &mut info.muted,
                Flag::Frozen => &mut info.frozen,
            };
            if *slot == value {
                return Ok(());
            }
            *slot = value;
        }
        let what = match flag {
            Flag::Muted => Announce::Muted(value),
            Flag::Frozen => {
                self.core.store.set_frozen(value);
                Announce::Frozen(value)
            }
        };
        debug!(agent = %self.name(), ?flag, value, "Agent flag changed");
        kernel.submit(Command::Announce {
            agent: self.uuid(),
            what,
        })
    }

    pub fn observe_mute(&self, observer: impl Fn(&Agent, bool) + Send + Sync + 'static) {
        self.core
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mute
            .push(Arc::new(observer));
    }

    pub fn observe_freeze(&self, observer: impl Fn(&Agent, bool) + Send + Sync + 'static) {
        self.core
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .freeze
            .push(Arc::new(observer));
    }

    // -----------------------------------------------------------------------
    // Catalog and routing
    // -----------------------------------------------------------------------

    pub fn definition(&self) -> &DefinitionStore {
        &self.core.store
    }

    pub fn mapping(&self) -> &MappingEngine {
        &self.core.mapping
    }

    pub fn input_create(&self, name: &str, value_type: ValueType, initial: Option<IoValue>) -> BusResult<()> {
        self.core.store.create_io(IoKind::Input, name, value_type, initial)
    }

    pub fn output_create(&self, name: &str, value_type: ValueType, initial: Option<IoValue>) -> BusResult<()> {
        self.core.store.create_io(IoKind::Output, name, value_type, initial)
    }

    pub fn attribute_create(&self, name: &str, value_type: ValueType, initial: Option<IoValue>) -> BusResult<()> {
        self.core.store.create_io(IoKind::Attribute, name, value_type, initial)
    }

    pub fn input(&self, name: &str) -> BusResult<IoValue> {
        self.core.store.value(IoKind::Input, name)
    }

    pub fn output(&self, name: &str) -> BusResult<IoValue> {
        self.core.store.value(IoKind::Output, name)
    }

    pub fn attribute(&self, name: &str) -> BusResult<IoValue> {
        self.core.store.value(IoKind::Attribute, name)
    }

    pub fn set_input(&self, name: &str, value: impl Into<IoValue>) -> BusResult<()> {
        self.core.store.set_value(IoKind::Input, name, value)
    }

    /// Write an output. It is published unless the output or the agent is
    /// muted or the agent is frozen.
    pub fn set_output(&self, name: &str, value: impl Into<IoValue>) -> BusResult<()> {
        self.core.store.set_value(IoKind::Output, name, value)
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<IoValue>) -> BusResult<()> {
        self.core.store.set_value(IoKind::Attribute, name, value)
    }

    pub fn observe_input(
        &self,
        name: &str,
        observer: impl Fn(&Agent, &IoUpdate) + Send + Sync + 'static,
    ) -> BusResult<()> {
        self.core.store.observe(IoKind::Input, name, self.bind(observer))
    }

    pub fn observe_output(
        &self,
        name: &str,
        observer: impl Fn(&Agent, &IoUpdate) + Send + Sync + 'static,
    ) -> BusResult<()> {
        self.core.store.observe(IoKind::Output, name, self.bind(observer))
    }

    pub fn observe_attribute(
        &self,
        name: &str,
        observer: impl Fn(&Agent, &IoUpdate) + Send + Sync + 'static,
    ) -> BusResult<()> {
        self.core.store.observe(IoKind::Attribute, name, self.bind(observer))
    }

    // -----------------------------------------------------------------------
    // Services
    // -----------------------------------------------------------------------

    /// Attach the handler of a service, declaring the service if needed.
    pub fn service_init(
        &self,
        name: &str,
        handler: impl Fn(&Agent, &ServiceCall) + Send + Sync + 'static,
    ) -> BusResult<()> {
        self.core.store.service_init(name, self.bind(handler))
    }

    /// Submit a call to every agent addressed by `target`.
    ///
    /// Success means the call was queued, not that it ran. Arguments are
    /// checked against the target's definition when it declares the service.
    pub fn call(
        &self,
        target: &str,
        service: &str,
        arguments: Vec<IoValue>,
        token: Option<&str>,
    ) -> BusResult<()> {
        validate_name(service)?;
        let kernel = self.kernel()?;
        kernel.require_started()?;

        let mut targets = Vec::new();
        for core in kernel.find_local(target) {
            check_call(target, &core.store.snapshot(), service, &arguments)?;
            targets.push(Target::Local(core.uuid()));
        }
        for remote in kernel.remote.find(target) {
            check_call(target, &remote.definition, service, &arguments)?;
            targets.push(Target::Remote {
                peer: remote.peer_id,
                uuid: remote.info.uuid,
            });
        }
        if targets.is_empty() {
            warn!(agent = %self.name(), target, service, "Call target not found");
            return Err(BusError::AgentNotFound(target.to_string()));
        }

        kernel.submit(Command::Call {
            caller: self.uuid(),
            targets,
            service: service.to_string(),
            arguments,
            token: token.map(str::to_string),
            timestamp: kernel.realtime.stamp(),
        })
    }

    /// Answer `call` by calling `reply` back on its sender, echoing its token.
    pub fn reply(&self, call: &ServiceCall, reply: &str, arguments: Vec<IoValue>) -> BusResult<()> {
        self.call(
            &call.sender_uuid.to_string(),
            reply,
            arguments,
            call.token.as_deref(),
        )
    }

    // -----------------------------------------------------------------------
    // Elections
    // -----------------------------------------------------------------------

    pub fn election_join(&self, election: &str) -> BusResult<()> {
        validate_name(election)?;
        let kernel = self.kernel()?;
        if !self.is_activated() {
            return Err(BusError::InvalidState(format!(
                "agent '{}' must be active to compete",
                self.name()
            )));
        }
        let resolution = kernel.elections.join(election, self.uuid())?;
        kernel.submit(Command::Election {
            agent: self.uuid(),
            election: election.to_string(),
            joined: true,
            resolution,
        })
    }

    pub fn election_leave(&self, election: &str) -> BusResult<()> {
        let kernel = self.kernel()?;
        let resolution = kernel.elections.leave(election, self.uuid())?;
        kernel.submit(Command::Election {
            agent: self.uuid(),
            election: election.to_string(),
            joined: false,
            resolution,
        })
    }

    pub fn elections(&self) -> Vec<String> {
        self.kernel()
            .map(|k| k.elections.elections_of(self.uuid()))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Channels and forced stop
    // -----------------------------------------------------------------------

    /// Best-effort multicast to every peer that joined `channel`.
    pub fn channel_shout(&self, channel: &str, payload: impl Into<Vec<u8>>) -> BusResult<()> {
        if is_reserved_channel(channel) {
            return Err(BusError::InvalidName(format!("channel '{channel}' is reserved")));
        }
        validate_name(channel)?;
        let kernel = self.kernel()?;
        kernel.require_started()?;
        kernel.submit(Command::Shout {
            agent: self.uuid(),
            channel: channel.to_string(),
            payload: payload.into(),
        })
    }

    /// Best-effort unicast to agents named `target`, else to peers of that name.
    pub fn channel_whisper(&self, target: &str, payload: impl Into<Vec<u8>>) -> BusResult<()> {
        let kernel = self.kernel()?;
        kernel.require_started()?;
        let targets = kernel.resolve(target, true);
        if targets.is_empty() {
            return Err(BusError::AgentNotFound(target.to_string()));
        }
        kernel.submit(Command::Whisper {
            agent: self.uuid(),
            targets,
            payload: payload.into(),
        })
    }

    pub fn observe_channels(
        &self,
        observer: impl Fn(&Agent, &ChannelMessage) + Send + Sync + 'static,
    ) {
        self.core
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .channels
            .push(Arc::new(observer));
    }

    /// Ask the agents addressed by `target` to stop. They only get notified.
    pub fn request_stop(&self, target: &str) -> BusResult<()> {
        let kernel = self.kernel()?;
        kernel.require_started()?;
        let targets = kernel.resolve(target, false);
        if targets.is_empty() {
            return Err(BusError::AgentNotFound(target.to_string()));
        }
        kernel.submit(Command::RequestStop {
            agent: self.uuid(),
            targets,
        })
    }

    /// Observers receive the name of the agent asking for the stop. They must
    /// not stop the kernel themselves.
    pub fn observe_forced_stop(&self, observer: impl Fn(&Agent, &str) + Send + Sync + 'static) {
        self.core
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forced_stop
            .push(Arc::new(observer));
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn observe_events(&self, observer: impl Fn(&Agent, &AgentEvent) + Send + Sync + 'static) {
        self.core
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .push(Arc::new(observer));
    }

    /// Events of this agent as a stream.
    pub fn subscribe_events(&self) -> BusResult<broadcast::Receiver<AgentEvent>> {
        Ok(self.kernel()?.events.subscribe_agent(self.uuid()))
    }

    /// Most recent events first.
    pub fn event_history(&self, limit: usize) -> Vec<AgentEvent> {
        self.kernel()
            .map(|k| k.events.agent_history(self.uuid(), limit))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn setup() -> (Kernel, Agent) {
        let kernel = Kernel::new(BusConfig::default()).unwrap();
        let agent = kernel.create_agent("probe").unwrap();
        (kernel, agent)
    }

    #[test]
    fn test_observers_run_on_worker_in_order() {
        let (_kernel, agent) = setup();
        agent.output_create("level", ValueType::Int, None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let s = seen.clone();
            agent
                .observe_output("level", move |a, update| {
                    s.lock().unwrap().push((tag, a.name(), update.value.clone()));
                })
                .unwrap();
        }
        agent.set_output("level", 7).unwrap();
        wait_until("observers", || seen.lock().unwrap().len() == 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("first", "probe".to_string(), Some(IoValue::Int(7))));
        assert_eq!(seen[1].0, "second");
    }

    #[test]
    fn test_constrained_write_fires_once() {
        let (_kernel, agent) = setup();
        agent.output_create("pct", ValueType::Double, Some(IoValue::Double(5.0))).unwrap();
        agent.definition().add_constraint(IoKind::Output, "pct", "[0, 100]").unwrap();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        agent
            .observe_output("pct", move |_, _| *h.lock().unwrap() += 1)
            .unwrap();

        assert!(matches!(
            agent.set_output("pct", 150.0),
            Err(BusError::ConstraintViolation { .. })
        ));
        assert_eq!(agent.output("pct").unwrap(), IoValue::Double(5.0));
        agent.set_output("pct", 50.0).unwrap();
        wait_until("one notification", || *hits.lock().unwrap() == 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_flags_notify_observers() {
        let (_kernel, agent) = setup();
        agent.input_create("cmd", ValueType::String, None).unwrap();
        let flags = Arc::new(Mutex::new(Vec::new()));
        let f = flags.clone();
        agent.observe_mute(move |_, muted| f.lock().unwrap().push(("mute", muted)));
        let f = flags.clone();
        agent.observe_freeze(move |_, frozen| f.lock().unwrap().push(("freeze", frozen)));

        agent.mute().unwrap();
        agent.mute().unwrap();
        agent.freeze().unwrap();
        assert!(agent.is_muted() && agent.is_frozen());
        assert!(matches!(agent.set_input("cmd", "go"), Err(BusError::Frozen(_))));
        agent.unfreeze().unwrap();
        agent.set_input("cmd", "go").unwrap();

        wait_until("flag observers", || flags.lock().unwrap().len() == 3);
        assert_eq!(
            *flags.lock().unwrap(),
            vec![("mute", true), ("freeze", true), ("freeze", false)]
        );
    }

    #[test]
    fn test_activation_is_checked() {
        let (_kernel, agent) = setup();
        assert!(agent.activate().is_err());
        agent.deactivate().unwrap();
        assert!(agent.deactivate().is_err());
        assert!(agent.election_join("leader").is_err());
        agent.activate().unwrap();
        agent.election_join("leader").unwrap();
        assert_eq!(agent.elections(), vec!["leader".to_string()]);
        assert!(agent.election_join("leader").is_err());
        agent.deactivate().unwrap();
        assert!(agent.elections().is_empty());
    }

    #[test]
    fn test_traffic_requires_started_kernel() {
        let (_kernel, agent) = setup();
        assert!(matches!(
            agent.call("probe", "ping", vec![], None),
            Err(BusError::InvalidState(_))
        ));
        assert!(matches!(
            agent.channel_shout("chat", "hi"),
            Err(BusError::InvalidState(_))
        ));
        assert!(matches!(
            agent.channel_shout("agentbus", "hi"),
            Err(BusError::InvalidName(_))
        ));
    }

    #[test]
    fn test_handles_outlive_kernel() {
        let (kernel, agent) = setup();
        agent.output_create("o", ValueType::Int, None).unwrap();
        drop(kernel);
        assert!(matches!(agent.set_output("o", 1), Err(BusError::ShuttingDown)));
        assert!(agent.elections().is_empty());
    }
}
