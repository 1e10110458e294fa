//! Worker supervision: shutdown signal and callback panic containment.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown signal plus a guard that keeps user callbacks from taking the
/// worker down.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Callbacks that panicked since boot.
    panic_count: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            panic_count: AtomicU64::new(0),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn shutdown(&self) {
        info!("Supervisor: shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run a user callback, catching and counting a panic.
    ///
    /// Returns `None` when the callback panicked.
    pub fn guard<T>(&self, what: &str, f: impl FnOnce() -> T) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                let total = self.panic_count.fetch_add(1, Ordering::Relaxed) + 1;
                error!(callback = what, panic = %message, total_panics = total, "Callback panicked");
                None
            }
        }
    }

    pub fn panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            panic_count: self.panic_count(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub panic_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown() {
        let supervisor = Supervisor::new();
        let rx = supervisor.subscribe();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        assert!(supervisor.is_shutting_down());
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_guard_counts_panics() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.guard("ok", || 5), Some(5));
        assert_eq!(supervisor.guard("boom", || -> i32 { panic!("boom") }), None);
        assert_eq!(supervisor.guard("boom", || panic!("{}", String::from("x"))), None::<()>);
        let health = supervisor.health();
        assert_eq!(health.panic_count, 2);
        assert!(!health.is_shutting_down);
    }
}
