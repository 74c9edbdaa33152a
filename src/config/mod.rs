//! Configuration management for bmd-node
//!
//! Handles the tunable knobs of the peer engine: queue depths, inventory
//! limits and connection timing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Peer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Depth of the outbound-message and inventory-hint channels per peer.
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,

    /// Maximum inventory vectors per trickled inv message.
    #[serde(default = "default_max_inv_trickle_size")]
    pub max_inv_trickle_size: usize,

    /// Capacity of the per-peer known-inventory cache.
    #[serde(default = "default_max_known_inventory")]
    pub max_known_inventory: usize,

    /// Seconds of inactivity allowed before the initial version negotiation
    /// must have completed.
    #[serde(default = "default_negotiate_timeout")]
    pub negotiate_timeout_seconds: u64,

    /// Seconds of inactivity before an established peer is timed out.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Seconds since the last message requiring a reply before a host would
    /// be pinged.
    // TODO: emit pings when a reply is overdue by this long.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_seconds: u64,

    /// Seconds between flushes of the pending-inventory queue.
    #[serde(default = "default_trickle_interval")]
    pub trickle_interval_seconds: u64,
}

fn default_output_buffer_size() -> usize {
    50
}

fn default_max_inv_trickle_size() -> usize {
    1000
}

fn default_max_known_inventory() -> usize {
    1000
}

fn default_negotiate_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    5 * 60
}

fn default_ping_timeout() -> u64 {
    2 * 60
}

fn default_trickle_interval() -> u64 {
    10
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: default_output_buffer_size(),
            max_inv_trickle_size: default_max_inv_trickle_size(),
            max_known_inventory: default_max_known_inventory(),
            negotiate_timeout_seconds: default_negotiate_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            ping_timeout_seconds: default_ping_timeout(),
            trickle_interval_seconds: default_trickle_interval(),
        }
    }
}

impl NetworkConfig {
    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiate_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_seconds)
    }

    pub fn trickle_interval(&self) -> Duration {
        Duration::from_secs(self.trickle_interval_seconds)
    }
}
