//! Timers running on the worker runtime.

use crate::supervisor::Supervisor;
use agentbus_types::error::{BusError, BusResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Shortest accepted period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Default)]
pub struct Timers {
    next: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` every `period`, `times` times (0 repeats forever).
    pub fn start(
        &self,
        handle: &Handle,
        period: Duration,
        times: u32,
        supervisor: Arc<Supervisor>,
        callback: impl Fn(TimerId) + Send + Sync + 'static,
    ) -> TimerId {
        let id = TimerId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let period = period.max(MIN_PERIOD);
        let tasks = self.tasks.clone();

        // Held across spawn so the task cannot deregister before it is registered.
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            let mut fired = 0u32;
            loop {
                ticker.tick().await;
                supervisor.guard("timer", || callback(id));
                fired = fired.saturating_add(1);
                if times != 0 && fired >= times {
                    break;
                }
            }
            tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });
        guard.insert(id, task);
        debug!(%id, ?period, times, "Timer started");
        id
    }

    pub fn stop(&self, id: TimerId) -> BusResult<()> {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or_else(|| BusError::not_found("timer", id.to_string()))?;
        task.abort();
        Ok(())
    }

    pub fn stop_all(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, task) in tasks {
            task.abort();
        }
    }

    pub fn active(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(TimerId) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_timer_fires_n_times_then_ends() {
        let timers = Timers::new();
        let (hits, cb) = counter();
        timers.start(&Handle::current(), Duration::from_millis(5), 3, Arc::new(Supervisor::new()), cb);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels() {
        let timers = Timers::new();
        let (hits, cb) = counter();
        let id = timers.start(&Handle::current(), Duration::from_millis(50), 0, Arc::new(Supervisor::new()), cb);
        timers.stop(id).unwrap();
        assert!(timers.stop(id).is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_timer_keeps_ticking() {
        let timers = Timers::new();
        let sup = Arc::new(Supervisor::new());
        timers.start(&Handle::current(), Duration::from_millis(5), 2, sup.clone(), |_| panic!("tick"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.panic_count(), 2);
        timers.stop_all();
        assert_eq!(timers.active(), 0);
    }
}
