//! Bus configuration, loaded from TOML by the kernel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default UDP/TCP port for beacon discovery.
pub const DEFAULT_PORT: u16 = 5670;

/// Historical bound on outstanding worker jobs.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Peer name announced to the bus. Defaults to the host name.
    pub peer_name: Option<String>,
    /// Ask remote agents for their current outputs when a mapping targets them.
    pub outputs_request: bool,
    /// Reject writes that violate IO constraints.
    pub constraints_enforce: bool,
    /// Log every publication and received value at debug level.
    pub log_include_data: bool,
    /// Log every service call at info level.
    pub log_include_services: bool,
    /// Warn when a call targets a service we do not declare.
    pub warn_on_undefined_service: bool,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub monitor: MonitorConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            peer_name: None,
            outputs_request: false,
            constraints_enforce: true,
            log_include_data: false,
            log_include_services: false,
            warn_on_undefined_service: true,
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    /// Beacon period.
    pub discovery_interval_ms: u64,
    /// Silence after which a peer is considered gone.
    pub peer_timeout_ms: u64,
    /// Bound of the worker queue.
    pub publish_queue_capacity: usize,
    /// Remove the worker queue bound entirely.
    pub unbounded_queue: bool,
    /// Arbitrary key/value headers announced with our peer.
    pub headers: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            discovery_interval_ms: 1000,
            peer_timeout_ms: 30_000,
            publish_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            unbounded_queue: false,
            headers: BTreeMap::new(),
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    /// Persisted private key. `None` means an ephemeral keypair.
    pub private_key: Option<PathBuf>,
    /// Directory of accepted public keys. Required with `private_key`.
    pub public_keys_dir: Option<PathBuf>,
}

/// `[monitor]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period. `None` leaves the monitor off.
    pub period_ms: Option<u64>,
    /// Stop and restart the transport on network changes.
    pub start_stop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.constraints_enforce);
        assert!(config.warn_on_undefined_service);
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.publish_queue_capacity, 1000);
        assert!(!config.security.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: BusConfig = toml::from_str(
            r#"
            outputs_request = true

            [network]
            port = 6000

            [network.headers]
            site = "lab"

            [security]
            enabled = true
        "#,
        )
        .unwrap();
        assert!(config.outputs_request);
        assert_eq!(config.network.port, 6000);
        assert_eq!(config.network.peer_timeout_ms, 30_000);
        assert_eq!(config.network.headers.get("site").map(String::as_str), Some("lab"));
        assert!(config.security.enabled);
        assert!(config.security.private_key.is_none());
    }
}
