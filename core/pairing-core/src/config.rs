//! Pairing tunables, loaded from `<storage root>/config.json`.
//!
//! Every field has a default, so a partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use fs_err as fs;
use pairing_protocol::{DEFAULT_DEDUP_WINDOW_MS, DEFAULT_MAILBOX_CAPACITY};
use serde::{Deserialize, Serialize};

use crate::error::{PairingError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Session lifetime from creation.
    pub session_ttl_secs: u64,
    /// Same-type messages closer than this are duplicates.
    pub dedup_window_ms: u64,
    pub mailbox_capacity: usize,
    pub poll_interval_pairing_ms: u64,
    pub poll_interval_connected_ms: u64,
    /// Delay before stale `connected` announcements are purged after connecting.
    pub connected_grace_ms: u64,
    /// Port used in join URLs when the desktop origin has none.
    pub default_port: u16,
    /// Last-resort LAN address when discovery finds nothing.
    pub fallback_host: String,
    pub status_log_every: u64,
    pub origin_hint_every: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 10 * 60,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            poll_interval_pairing_ms: 200,
            poll_interval_connected_ms: 300,
            connected_grace_ms: 2000,
            default_port: 3356,
            fallback_host: "169.254.153.138".to_string(),
            status_log_every: 25,
            origin_hint_every: 40,
        }
    }
}

impl PairingConfig {
    pub fn session_ttl_millis(&self) -> i64 {
        (self.session_ttl_secs as i64).saturating_mul(1000)
    }

    pub fn poll_interval(&self, connected: bool) -> Duration {
        if connected {
            Duration::from_millis(self.poll_interval_connected_ms)
        } else {
            Duration::from_millis(self.poll_interval_pairing_ms)
        }
    }

    pub fn connected_grace(&self) -> Duration {
        Duration::from_millis(self.connected_grace_ms)
    }
}

/// Loads the config, returning defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<PairingConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PairingConfig::default())
        }
        Err(err) => return Err(PairingError::storage("read config", err)),
    };

    if content.trim().is_empty() {
        return Ok(PairingConfig::default());
    }

    serde_json::from_str(&content).map_err(|e| PairingError::Config {
        path: path.to_path_buf(),
        details: e.to_string(),
    })
}
