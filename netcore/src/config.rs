//! Core and per-device tunables.
//!
//! Defaults carry the values the stack has always shipped with; embedders
//! override them programmatically or by deserializing a JSON document.

use serde::{Deserialize, Serialize};

fn default_resolve_timeout_us() -> u64 {
    4_500_000
}

fn default_resolve_retry_us() -> u64 {
    1_000_000
}

fn default_resolve_retries() -> u32 {
    4
}

fn default_fragment_timeout_us() -> u64 {
    5_000_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_wake_capacity() -> usize {
    4
}

fn default_rx_max() -> usize {
    10
}

fn default_processing_weight() -> usize {
    15_000
}

/// Process-wide tunables shared by every device registered with a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Time budget for resolving a destination; unresolved entries are
    /// dropped once this expires.
    #[serde(default = "default_resolve_timeout_us")]
    pub resolve_timeout_us: u64,
    /// Minimum spacing between two resolution attempts for one entry.
    #[serde(default = "default_resolve_retry_us")]
    pub resolve_retry_us: u64,
    /// Resolution attempts before an entry is deemed unresolvable.
    #[serde(default = "default_resolve_retries")]
    pub resolve_retries: u32,
    /// Idle time after which an incomplete reassembly bucket is swept.
    #[serde(default = "default_fragment_timeout_us")]
    pub fragment_timeout_us: u64,
    /// Fallback poll interval for the dispatcher thread.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the dispatcher wake event.
    #[serde(default = "default_wake_capacity")]
    pub wake_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            resolve_timeout_us: default_resolve_timeout_us(),
            resolve_retry_us: default_resolve_retry_us(),
            resolve_retries: default_resolve_retries(),
            fragment_timeout_us: default_fragment_timeout_us(),
            poll_interval_ms: default_poll_interval_ms(),
            wake_capacity: default_wake_capacity(),
        }
    }
}

impl CoreConfig {
    /// Parse a configuration from a JSON document. Missing fields keep
    /// their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Per-device scheduling limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Maximum number of frames one poll admits from the driver.
    #[serde(default = "default_rx_max")]
    pub rx_max: usize,
    /// Byte budget one scheduler pass may drain from the backlog.
    #[serde(default = "default_processing_weight")]
    pub processing_weight: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            rx_max: default_rx_max(),
            processing_weight: default_processing_weight(),
        }
    }
}
