// src/config.rs

//! Cluster configuration: the tunables that govern timeouts, quorum, and
//! announced addressing, loaded from a TOML file the way the host store
//! loads its own `Config`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_node_timeout_ms() -> u64 {
    15_000
}

fn default_migration_barrier() -> u32 {
    1
}

fn default_bus_port_offset() -> u16 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Cluster-wide tunables. Mirrors the shape of the host store's top-level
/// `Config`, but scoped to the subset this crate owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub config_file: Option<PathBuf>,

    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    #[serde(default)]
    pub announce_ip: Option<String>,

    pub announce_port: u16,

    #[serde(default)]
    pub announce_bus_port: Option<u16>,

    #[serde(default)]
    pub announce_plaintext_port: Option<u16>,

    #[serde(default = "default_bus_port_offset")]
    pub bus_port_offset: u16,

    /// Minimum number of online masters required before this node accepts
    /// writes; `None` falls back to the computed majority quorum.
    #[serde(default)]
    pub failover_quorum: Option<usize>,

    /// Minimum number of healthy replicas a master must retain before its
    /// replicas will attempt replica migration toward it.
    #[serde(default = "default_migration_barrier")]
    pub migration_barrier: u32,

    /// If `false`, replicas never auto-promote on a master's failure; manual
    /// failover is still available.
    #[serde(default = "default_true")]
    pub replica_auto_failover: bool,

    /// If `true`, replicas serve reads for slots they don't own primary
    /// responsibility for, honoring the `READONLY` connection flag.
    #[serde(default)]
    pub allow_replica_reads: bool,

    /// Shared secret for HMAC-SHA256 signing of gossip payloads. Absent means
    /// the bus runs unauthenticated, matching an unconfigured host deployment.
    #[serde(default)]
    pub bus_shared_secret: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_file: None,
            node_timeout_ms: default_node_timeout_ms(),
            announce_ip: None,
            announce_port: 6379,
            announce_bus_port: None,
            announce_plaintext_port: None,
            bus_port_offset: default_bus_port_offset(),
            failover_quorum: None,
            migration_barrier: default_migration_barrier(),
            replica_auto_failover: true,
            allow_replica_reads: false,
            bus_shared_secret: None,
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: ClusterConfig = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn bus_port(&self) -> u16 {
        self.announce_bus_port
            .unwrap_or_else(|| self.announce_port.wrapping_add(self.bus_port_offset))
    }
}
