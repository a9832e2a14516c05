// src/lib.rs

//! Cluster coordination and membership core: gossip-based failure detection,
//! epoch-based leader election, 16384-slot routing with live migration, and
//! client redirection, extracted as a standalone library so a RESP server
//! can embed it without pulling in a storage engine.

pub mod blacklist;
pub mod command;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod election;
pub mod errors;
pub mod failure_detector;
pub mod gossip;
pub mod link;
pub mod manual_failover;
pub mod node;
pub mod persistence;
pub mod redirect;
pub mod registry;
pub mod slots;
pub mod state;
pub mod wire;

pub use config::ClusterConfig;
pub use errors::ClusterError;
pub use node::{ClusterNode, NodeAddr, NodeFlags, NodeRole, NodeRuntimeState};
pub use state::{ClusterHealth, ClusterState};

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates a fresh 40-character hex node id the way the host store mints
/// new identities: 20 random bytes hex-encoded, with the current time mixed
/// in so two nodes started in the same process tick still diverge.
pub fn generate_node_id() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 20];
    rng.fill(&mut bytes);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().subsec_nanos();
    bytes[0] ^= (nanos & 0xff) as u8;
    hex::encode(bytes)
}
