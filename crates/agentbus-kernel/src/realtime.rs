//! Real-time clock, timestamping and synchronous publication.
//!
//! Timestamps are microseconds. Once the clock has been set manually it
//! stays manual and timestamping stays on for the life of the kernel.

use agentbus_types::agent::AgentId;
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::event::{IoUpdate, NO_TIMESTAMP};
use agentbus_types::value::ValueType;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

/// An output write waiting for the next clock tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutput {
    pub agent: AgentId,
    pub update: IoUpdate,
}

pub struct RealTime {
    timestamps: AtomicBool,
    synchronous: AtomicBool,
    manual: AtomicI64,
    pending: Mutex<Vec<PendingOutput>>,
}

impl Default for RealTime {
    fn default() -> Self {
        Self {
            timestamps: AtomicBool::new(false),
            synchronous: AtomicBool::new(false),
            manual: AtomicI64::new(NO_TIMESTAMP),
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manual clock once set, otherwise wall-clock time.
    pub fn now(&self) -> i64 {
        match self.manual.load(Ordering::Acquire) {
            NO_TIMESTAMP => chrono::Utc::now().timestamp_micros(),
            manual => manual,
        }
    }

    /// Timestamp for an outgoing write or call, if timestamping is on.
    pub fn stamp(&self) -> i64 {
        if self.timestamps_enabled() {
            self.now()
        } else {
            NO_TIMESTAMP
        }
    }

    pub fn timestamps_enabled(&self) -> bool {
        self.timestamps.load(Ordering::Acquire)
    }

    /// Has no effect once the clock has been set manually.
    pub fn set_timestamps(&self, enabled: bool) {
        if self.is_manual() {
            return;
        }
        self.timestamps.store(enabled, Ordering::Release);
    }

    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Acquire) != NO_TIMESTAMP
    }

    /// Advance the manual clock. Returns the buffered writes to publish now.
    ///
    /// `NO_TIMESTAMP` marks an unset clock and cannot be set.
    pub fn set_time(&self, micros: i64) -> BusResult<Vec<PendingOutput>> {
        if micros == NO_TIMESTAMP {
            return Err(BusError::InvalidState(format!(
                "{micros} is reserved for an absent timestamp"
            )));
        }
        self.manual.store(micros, Ordering::Release);
        self.timestamps.store(true, Ordering::Release);
        Ok(self.drain())
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::Acquire)
    }

    /// Turning synchronous mode off returns whatever was still buffered.
    pub fn set_synchronous(&self, enabled: bool) -> Vec<PendingOutput> {
        self.synchronous.store(enabled, Ordering::Release);
        if enabled {
            Vec::new()
        } else {
            self.drain()
        }
    }

    /// Buffer an output write until the next tick.
    ///
    /// A write replaces a pending write of the same output; impulsions are
    /// all kept.
    pub fn buffer(&self, agent: AgentId, update: IoUpdate) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if update.value_type != ValueType::Impulsion {
            if let Some(slot) = pending
                .iter_mut()
                .find(|p| p.agent == agent && p.update.name == update.name)
            {
                slot.update = update;
                return;
            }
        }
        pending.push(PendingOutput { agent, update });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn drain(&self) -> Vec<PendingOutput> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Drop buffered writes of one agent.
    pub fn discard(&self, agent: AgentId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.agent != agent);
    }
}
