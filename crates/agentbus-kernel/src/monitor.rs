//! Network monitor: watches the address of the device the bus runs on.
//!
//! Device enumeration is delegated to a [`NetworkProbe`]. The sampler turns
//! successive observations into [`MonitorEvent`]s; what to do about them
//! (notify observers, suspend or restart the transport) is the kernel's call.

use agentbus_types::event::MonitorEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Looks up the current address of a network device.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// `None` when the device is missing or has no usable address.
    async fn address_of(&self, device: &str) -> Option<IpAddr>;
}

/// A probe answering from a table the application maintains.
#[derive(Debug, Default)]
pub struct StaticProbe {
    devices: Mutex<HashMap<String, IpAddr>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device: &str, ip: IpAddr) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.to_string(), ip);
    }

    pub fn remove(&self, device: &str) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device);
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn address_of(&self, device: &str) -> Option<IpAddr> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
            .copied()
    }
}

/// Last observation of the monitored device.
#[derive(Debug, Default)]
pub struct MonitorState {
    device: Option<String>,
    last: Option<IpAddr>,
}

impl MonitorState {
    /// Fold in a sample. The first sample of a device only sets the baseline.
    pub fn observe(&mut self, device: &str, current: Option<IpAddr>) -> Option<MonitorEvent> {
        if self.device.as_deref() != Some(device) {
            self.device = Some(device.to_string());
            self.last = current;
            return None;
        }
        let event = match (self.last, current) {
            (Some(_), None) => Some(MonitorEvent::DeviceNotAvailable {
                device: device.to_string(),
            }),
            (None, Some(ip)) => Some(MonitorEvent::NetworkOk {
                device: device.to_string(),
                ip: ip.to_string(),
            }),
            (Some(old), Some(ip)) if old != ip => Some(MonitorEvent::AddressChanged {
                device: device.to_string(),
                ip: ip.to_string(),
            }),
            _ => None,
        };
        self.last = current;
        event
    }
}

/// Sample `device()` every `period` and hand changes to `sink`.
///
/// `device` is re-read on every tick; while it yields `None` nothing is
/// sampled.
pub(crate) fn spawn(
    handle: &Handle,
    probe: Arc<dyn NetworkProbe>,
    period: Duration,
    device: impl Fn() -> Option<String> + Send + 'static,
    sink: impl Fn(MonitorEvent) + Send + 'static,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut state = MonitorState::default();
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            let Some(device) = device() else { continue };
            let current = probe.address_of(&device).await;
            if let Some(event) = state.observe(&device, current) {
                debug!(?event, "Network change observed");
                sink(event);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let mut state = MonitorState::default();
        assert_eq!(state.observe("eth0", Some(ip("10.0.0.1"))), None);
        assert_eq!(state.observe("eth0", Some(ip("10.0.0.1"))), None);
        assert_eq!(
            state.observe("eth0", None),
            Some(MonitorEvent::DeviceNotAvailable { device: "eth0".into() })
        );
        assert_eq!(
            state.observe("eth0", Some(ip("10.0.0.2"))),
            Some(MonitorEvent::NetworkOk {
                device: "eth0".into(),
                ip: "10.0.0.2".into()
            })
        );
        assert_eq!(
            state.observe("eth0", Some(ip("10.0.0.3"))),
            Some(MonitorEvent::AddressChanged {
                device: "eth0".into(),
                ip: "10.0.0.3".into()
            })
        );
        // Switching devices resets the baseline.
        assert_eq!(state.observe("wlan0", None), None);
    }

    #[tokio::test]
    async fn test_sampler_reports_changes() {
        let probe = Arc::new(StaticProbe::new());
        probe.set("eth0", ip("192.168.0.10"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let task = spawn(
            &Handle::current(),
            probe.clone(),
            Duration::from_millis(5),
            || Some("eth0".to_string()),
            move |e| sink.lock().unwrap().push(e),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        probe.remove("eth0");
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.abort();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![MonitorEvent::DeviceNotAvailable { device: "eth0".into() }]
        );
    }
}
