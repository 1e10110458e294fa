//! Scheduler: hands work from application threads to the bus worker.
//!
//! Operations that touch the network or fire callbacks become [`Command`]s
//! on a crossbeam queue drained by the worker thread. The queue is bounded by
//! `publish_queue_capacity` unless configured unbounded. A full queue blocks
//! application threads; the worker itself must never block on its own queue,
//! so it gets [`BusError::QueueFull`] instead.

use crate::election::Resolution;
use crate::error::KernelResult;
use crate::realtime::PendingOutput;
use agentbus_types::agent::{AgentId, AgentInfo};
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::{IoUpdate, MonitorEvent};
use agentbus_types::value::IoValue;
use agentbus_wire::{Identity, LoopbackHub};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::cell::Cell;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

static NEXT_SCHEDULER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the scheduler whose worker runs on this thread, 0 elsewhere.
    static WORKER_OF: Cell<u64> = const { Cell::new(0) };
}

/// How the transport is brought up.
#[derive(Debug, Clone)]
pub(crate) enum StartMode {
    /// In-process hub.
    Loopback(LoopbackHub),
    /// Beacon discovery from the interface bound at `ip`.
    Ip { ip: IpAddr, port: u16 },
    /// Beacon discovery from whatever address `device` currently has.
    Device { device: String, port: u16 },
    /// Broker discovery, reachable at `endpoint`.
    Brokers { endpoint: String },
}

/// What a local agent tells its peers about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Announce {
    Definition,
    Mapping,
    /// Name, family or state.
    Info,
    Muted(bool),
    Frozen(bool),
    Activated,
    /// Carries the identity since the agent may be gone by the time it is sent.
    Deactivated(AgentInfo),
}

/// Where a call, whisper or stop request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Local(AgentId),
    Remote { peer: String, uuid: AgentId },
    /// Every agent of a peer, addressed by peer name or id.
    Peer(String),
}

#[derive(Debug)]
pub(crate) enum Command {
    Start {
        mode: StartMode,
        identity: Option<Arc<Identity>>,
        reply: Sender<KernelResult<()>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Written {
        agent: AgentId,
        update: IoUpdate,
    },
    Announce {
        agent: AgentId,
        what: Announce,
    },
    Call {
        caller: AgentId,
        targets: Vec<Target>,
        service: String,
        arguments: Vec<IoValue>,
        token: Option<String>,
        timestamp: i64,
    },
    Election {
        agent: AgentId,
        election: String,
        joined: bool,
        resolution: Option<Resolution>,
    },
    Shout {
        agent: AgentId,
        channel: String,
        payload: Vec<u8>,
    },
    Whisper {
        agent: AgentId,
        targets: Vec<Target>,
        payload: Vec<u8>,
    },
    RequestStop {
        agent: AgentId,
        targets: Vec<Target>,
    },
    /// Re-compute channel subscriptions.
    Channels,
    /// Publish writes held back by synchronous mode.
    Flush(Vec<PendingOutput>),
    Monitor(MonitorEvent),
    Shutdown,
}

pub(crate) struct Scheduler {
    id: u64,
    tx: Sender<Command>,
    notify: Arc<Notify>,
}

impl Scheduler {
    /// `capacity` of `None` makes the queue unbounded.
    pub(crate) fn new(capacity: Option<usize>) -> (Self, Receiver<Command>, Arc<Notify>) {
        let (tx, rx) = match capacity {
            Some(capacity) => channel::bounded(capacity.max(1)),
            None => channel::unbounded(),
        };
        let notify = Arc::new(Notify::new());
        let scheduler = Self {
            id: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
            tx,
            notify: notify.clone(),
        };
        (scheduler, rx, notify)
    }

    /// Queue a command and wake the worker.
    pub(crate) fn submit(&self, command: Command) -> BusResult<()> {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Disconnected(_)) => return Err(BusError::ShuttingDown),
            Err(TrySendError::Full(_)) if self.on_worker() => {
                return Err(BusError::QueueFull(self.tx.len()));
            }
            Err(TrySendError::Full(command)) => {
                warn!(pending = self.tx.len(), "Worker queue is full, blocking until it drains");
                self.notify.notify_one();
                self.tx.send(command).map_err(|_| BusError::ShuttingDown)?;
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Mark the current thread as this scheduler's worker.
    pub(crate) fn enter_worker(&self) {
        WORKER_OF.with(|w| w.set(self.id));
    }

    pub(crate) fn on_worker(&self) -> bool {
        WORKER_OF.with(|w| w.get() == self.id)
    }

    /// Commands waiting for the worker.
    pub(crate) fn depth(&self) -> usize {
        self.tx.len()
    }
}
