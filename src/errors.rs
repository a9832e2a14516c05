// src/errors.rs

//! Defines the primary error type for the cluster coordination core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, covering the failure taxonomy of the cluster subsystem:
/// transient I/O, protocol violations, semantic rejections, topology-file I/O,
/// and invariant violations.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("cluster bus protocol violation: {0}")]
    Protocol(String),

    #[error("cluster is not enabled")]
    NotEnabled,

    #[error("unknown node id '{0}'")]
    UnknownNode(String),

    #[error("slot {0} is already owned by another node")]
    SlotAlreadyOwned(u16),

    #[error("invalid slot value {0}, must be in [0, 16383]")]
    InvalidSlot(u32),

    #[error("node {0} cannot be removed: remove its slots or replicas first")]
    NodeBusy(String),

    #[error("already voted in epoch {0}")]
    AlreadyVoted(u64),

    /// A redirect indicating the key's slot is permanently owned elsewhere.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A transient redirect for a slot that is mid-migration.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    /// A multi-key command spanned more than one hash slot.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// The cluster cannot currently guarantee consistency for this request.
    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    /// A write was rejected on a node kept read-only by a planned migration.
    #[error("CLUSTERDOWN-RO {0}")]
    ClusterDownReadOnly(String),

    /// A blocking command or a paused write should be retried shortly.
    #[error("TRYAGAIN {0}")]
    TryAgain(String),

    #[error("topology file error: {0}")]
    TopologyFile(String),

    #[error("internal invariant violation: {0}")]
    Invariant(String),
}

impl PartialEq for ClusterError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.to_string() == b.to_string(),
            (Self::Protocol(a), Self::Protocol(b)) => a == b,
            (Self::NotEnabled, Self::NotEnabled) => true,
            (Self::UnknownNode(a), Self::UnknownNode(b)) => a == b,
            (Self::SlotAlreadyOwned(a), Self::SlotAlreadyOwned(b)) => a == b,
            (Self::InvalidSlot(a), Self::InvalidSlot(b)) => a == b,
            (Self::NodeBusy(a), Self::NodeBusy(b)) => a == b,
            (Self::AlreadyVoted(a), Self::AlreadyVoted(b)) => a == b,
            (Self::Moved { slot: s1, addr: a1 }, Self::Moved { slot: s2, addr: a2 }) => {
                s1 == s2 && a1 == a2
            }
            (Self::Ask { slot: s1, addr: a1 }, Self::Ask { slot: s2, addr: a2 }) => {
                s1 == s2 && a1 == a2
            }
            (Self::CrossSlot, Self::CrossSlot) => true,
            (Self::ClusterDown(a), Self::ClusterDown(b)) => a == b,
            (Self::ClusterDownReadOnly(a), Self::ClusterDownReadOnly(b)) => a == b,
            (Self::TryAgain(a), Self::TryAgain(b)) => a == b,
            (Self::TopologyFile(a), Self::TopologyFile(b)) => a == b,
            (Self::Invariant(a), Self::Invariant(b)) => a == b,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(e))
    }
}
