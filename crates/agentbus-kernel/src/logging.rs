//! Tracing setup for hosting applications.
//!
//! The core only emits `tracing` events. These helpers install a subscriber
//! filtered by the configured level; `RUST_LOG` takes precedence when set.
//! Installing twice is harmless: the second call reports `false`.

use std::path::Path;
use tracing_subscriber::EnvFilter;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Log to stderr. Returns whether this call installed the subscriber.
pub fn init_tracing(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .try_init()
        .is_ok()
}

/// Log to stderr as one JSON object per line.
pub fn init_tracing_json(level: &str) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(level))
        .try_init()
        .is_ok()
}

/// Log to a file, creating its directory if needed.
pub fn init_tracing_file(path: &Path, level: &str) -> std::io::Result<bool> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .is_ok())
}
