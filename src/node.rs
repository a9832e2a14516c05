// src/node.rs

//! Node identity, flags, and the per-node state gossiped and persisted across
//! the cluster bus.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

/// The role of a node: a node is either a primary or a replica, never both
/// (data model invariant i).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum NodeRole {
    Primary,
    Replica,
}

bitflags! {
    /// Health and membership flags for a cluster node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct NodeFlags: u16 {
        const MYSELF    = 1 << 0;
        const PRIMARY   = 1 << 1;
        const REPLICA   = 1 << 2;
        const PFAIL     = 1 << 3;
        const FAIL      = 1 << 4;
        const HANDSHAKE = 1 << 5;
        const NOADDR    = 1 << 6;
        const MIGRATING = 1 << 7;
        const IMPORTING = 1 << 8;
        const NOFLAGS   = 1 << 9;
    }
}

impl NodeFlags {
    /// Renders the flags in the comma-separated order the `nodes.conf` format
    /// and `CLUSTER NODES` output expect.
    pub fn to_csv(self) -> String {
        if self.is_empty() {
            return "noflags".to_string();
        }
        let mut parts = Vec::new();
        if self.contains(NodeFlags::MYSELF) {
            parts.push("myself");
        }
        if self.contains(NodeFlags::PRIMARY) {
            parts.push("master");
        }
        if self.contains(NodeFlags::REPLICA) {
            parts.push("slave");
        }
        if self.contains(NodeFlags::FAIL) {
            parts.push("fail");
        } else if self.contains(NodeFlags::PFAIL) {
            parts.push("fail?");
        }
        if self.contains(NodeFlags::HANDSHAKE) {
            parts.push("handshake");
        }
        if self.contains(NodeFlags::NOADDR) {
            parts.push("noaddr");
        }
        parts.join(",")
    }
}

/// The network identity of a node: the client-facing address, the cluster-bus
/// address, and an optional plaintext fallback port for TLS deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NodeAddr {
    pub ip: String,
    pub client_port: u16,
    pub bus_port: u16,
    #[serde(default)]
    pub plaintext_port: Option<u16>,
}

impl NodeAddr {
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.ip, self.client_port)
    }

    pub fn bus_addr(&self) -> String {
        format!("{}:{}", self.ip, self.bus_port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ip, self.client_port, self.bus_port)?;
        if let Some(pp) = self.plaintext_port {
            write!(f, ",{pp}")?;
        }
        Ok(())
    }
}

/// The configuration and ownership state of a node, exactly what gets
/// gossiped over the cluster bus and persisted to the topology file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterNode {
    pub id: String,
    pub addr: NodeAddr,
    pub role: NodeRole,
    pub flags: u16,
    pub replica_of: Option<String>,
    pub slots: BTreeSet<u16>,
    pub config_epoch: u64,
    #[serde(default)]
    pub replication_offset: u64,
    /// Slots this node is migrating out. Key: slot, value: destination node id.
    #[serde(default)]
    pub migrating_slots: BTreeMap<u16, String>,
    /// Slots this node is importing. Key: slot, value: source node id.
    #[serde(default)]
    pub importing_slots: BTreeMap<u16, String>,
}

impl ClusterNode {
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags = flags.bits();
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

/// The runtime-only state of a known node: timers and failure reports that are
/// neither gossiped nor persisted.
#[derive(Debug, Clone)]
pub struct NodeRuntimeState {
    pub info: ClusterNode,
    pub ping_sent: Option<Instant>,
    pub pong_received: Option<Instant>,
    /// `(reporter_id, report_time)` pairs; purged lazily on access (report
    /// validity window is `2 * node_timeout`).
    pub pfail_reports: Vec<(String, Instant)>,
    /// Non-zero (`Some`) iff the node currently carries the FAIL flag
    /// (data model invariant iv).
    pub fail_time: Option<Instant>,
}

impl NodeRuntimeState {
    pub fn new(info: ClusterNode) -> Self {
        Self {
            info,
            ping_sent: None,
            pong_received: None,
            pfail_reports: Vec::new(),
            fail_time: None,
        }
    }

    /// Drops failure reports older than `window` and reports from nodes that
    /// are not masters (a report from a non-master never counts for quorum).
    pub fn purge_stale_reports(&mut self, window: std::time::Duration) {
        let now = Instant::now();
        self.pfail_reports
            .retain(|(_, reported_at)| now.saturating_duration_since(*reported_at) < window);
    }
}
