// src/state.rs

//! `ClusterState`: the single object threaded through every component,
//! tying the node registry, slot map, blacklist, and epoch counters together
//! (Design Notes §9's "arena + shared state" resolution of the concurrency
//! model).

use crate::blacklist::Blacklist;
use crate::config::ClusterConfig;
use crate::election::CandidateElection;
use crate::manual_failover::ManualFailoverState;
use crate::node::{ClusterNode, NodeFlags};
use crate::registry::NodeRegistry;
use crate::slots::SlotMap;
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Cluster-wide health rollup, reported by `CLUSTER INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Fail,
}

/// Per-message-type counters for `CLUSTER INFO`'s `cluster_stats_messages_*`
/// fields.
#[derive(Debug, Default)]
pub struct MessageCounters {
    pub ping_sent: AtomicU64,
    pub ping_received: AtomicU64,
    pub pong_sent: AtomicU64,
    pub pong_received: AtomicU64,
    pub meet_sent: AtomicU64,
    pub meet_received: AtomicU64,
    pub fail_sent: AtomicU64,
    pub fail_received: AtomicU64,
    pub publish_sent: AtomicU64,
    pub publish_received: AtomicU64,
    pub auth_request_sent: AtomicU64,
    pub auth_request_received: AtomicU64,
    pub auth_ack_sent: AtomicU64,
    pub auth_ack_received: AtomicU64,
    pub update_sent: AtomicU64,
    pub update_received: AtomicU64,
}

impl MessageCounters {
    pub fn total_sent(&self) -> u64 {
        self.ping_sent.load(Ordering::Relaxed)
            + self.pong_sent.load(Ordering::Relaxed)
            + self.meet_sent.load(Ordering::Relaxed)
            + self.fail_sent.load(Ordering::Relaxed)
            + self.publish_sent.load(Ordering::Relaxed)
            + self.auth_request_sent.load(Ordering::Relaxed)
            + self.auth_ack_sent.load(Ordering::Relaxed)
            + self.update_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.ping_received.load(Ordering::Relaxed)
            + self.pong_received.load(Ordering::Relaxed)
            + self.meet_received.load(Ordering::Relaxed)
            + self.fail_received.load(Ordering::Relaxed)
            + self.publish_received.load(Ordering::Relaxed)
            + self.auth_request_received.load(Ordering::Relaxed)
            + self.auth_ack_received.load(Ordering::Relaxed)
            + self.update_received.load(Ordering::Relaxed)
    }
}

/// Deferred actions requested by message handlers but executed by the cron
/// driver, so the hot gossip-receive path never blocks on disk I/O.
#[derive(Debug, Default)]
pub struct DeferredActions {
    pub persist_topology: AtomicBool,
    pub recompute_health: AtomicBool,
}

impl DeferredActions {
    pub fn request_persist(&self) {
        self.persist_topology.store(true, Ordering::Relaxed);
    }

    pub fn take_persist(&self) -> bool {
        self.persist_topology.swap(false, Ordering::Relaxed)
    }

    pub fn request_health_recompute(&self) {
        self.recompute_health.store(true, Ordering::Relaxed);
    }

    pub fn take_health_recompute(&self) -> bool {
        self.recompute_health.swap(false, Ordering::Relaxed)
    }
}

/// In-flight replica-side election bookkeeping, driven from `cron::tick`.
#[derive(Default)]
pub struct ElectionRuntime {
    pub in_flight: Option<CandidateElection>,
    pub next_attempt_at: Option<Instant>,
}

pub struct ClusterState {
    pub config: ClusterConfig,
    pub registry: NodeRegistry,
    pub slots: SlotMap,
    pub blacklist: Blacklist,
    pub my_id: String,
    pub current_epoch: AtomicU64,
    pub last_vote_epoch: AtomicU64,
    pub counters: MessageCounters,
    pub deferred: DeferredActions,
    pub election: Mutex<ElectionRuntime>,
    pub manual_failover: Mutex<Option<ManualFailoverState>>,
    /// Last time a vote was cast for a replica of the given master id, keyed
    /// by master id, enforcing the "no two votes within 2x node_timeout for
    /// the same master" anti-flapping rule.
    pub last_vote_for_master: DashMap<String, Instant>,
    health: AtomicBool, // true == Ok
}

impl ClusterState {
    pub fn new(config: ClusterConfig, my_node: ClusterNode) -> Self {
        let my_id = my_node.id.clone();
        let registry = NodeRegistry::new();
        registry.add(my_node);
        Self {
            config,
            registry,
            slots: SlotMap::new(),
            blacklist: Blacklist::new(),
            my_id,
            current_epoch: AtomicU64::new(0),
            last_vote_epoch: AtomicU64::new(0),
            counters: MessageCounters::default(),
            deferred: DeferredActions::default(),
            election: Mutex::new(ElectionRuntime::default()),
            manual_failover: Mutex::new(None),
            last_vote_for_master: DashMap::new(),
            health: AtomicBool::new(false),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Bumps `current_epoch` to `at_least` if it is not already that high,
    /// returning the resulting epoch. Used both when observing a higher
    /// epoch from a peer and when minting a fresh epoch for this node.
    pub fn bump_epoch_to_at_least(&self, at_least: u64) -> u64 {
        self.current_epoch.fetch_max(at_least, Ordering::SeqCst);
        self.current_epoch()
    }

    /// Allocates the next config epoch for this node: one past the highest
    /// epoch known cluster-wide (own current epoch and every known node's
    /// config epoch).
    pub fn next_config_epoch(&self) -> u64 {
        let mut max_epoch = self.current_epoch();
        for entry in self.registry.iter() {
            max_epoch = max_epoch.max(entry.value().info.config_epoch);
        }
        let next = max_epoch + 1;
        self.current_epoch.fetch_max(next, Ordering::SeqCst);
        next
    }

    pub fn i_own_slot(&self, slot: u16) -> bool {
        self.slots.is_owned_by(slot, &self.my_id)
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<ClusterNode> {
        let owner_id = self.slots.owner(slot)?;
        self.registry.lookup(&owner_id).map(|r| r.info.clone())
    }

    /// Transfers every slot `from_id` owns to this node, bumping this node's
    /// config epoch past the cluster's current maximum so the takeover wins
    /// any gossip conflict (mirrors promotion-on-failover semantics).
    pub fn take_over_slots_from(&self, from_id: &str) {
        let taken: Vec<u16> = self
            .registry
            .lookup(from_id)
            .map(|r| r.info.slots.iter().copied().collect())
            .unwrap_or_default();
        if taken.is_empty() {
            return;
        }
        let new_epoch = self.next_config_epoch();
        for slot in &taken {
            self.slots.assign(*slot, &self.my_id);
        }
        if let Some(mut me) = self.registry.lookup_mut(&self.my_id) {
            me.info.slots.extend(taken.iter().copied());
            me.info.config_epoch = new_epoch;
        }
        if let Some(mut victim) = self.registry.lookup_mut(from_id) {
            for slot in &taken {
                victim.info.slots.remove(slot);
            }
        }
        self.deferred.request_persist();
    }

    pub fn count_online_masters(&self) -> usize {
        self.registry.count_online_masters()
    }

    /// Quorum required to promote a PFAIL report to FAIL: more than half of
    /// the known online masters.
    pub fn fail_quorum(&self) -> usize {
        self.config
            .failover_quorum
            .unwrap_or_else(|| self.count_online_masters() / 2 + 1)
    }

    pub fn health(&self) -> ClusterHealth {
        if self.health.load(Ordering::Relaxed) {
            ClusterHealth::Ok
        } else {
            ClusterHealth::Fail
        }
    }

    /// Recomputes cluster health: OK iff every slot is assigned to a node
    /// that is not FAILed.
    pub fn recompute_health(&self) {
        let mut all_covered = true;
        for slot in 0..crate::slots::NUM_SLOTS as u16 {
            match self.slots.owner(slot) {
                None => {
                    all_covered = false;
                    break;
                }
                Some(owner) => {
                    let failed = self
                        .registry
                        .lookup(&owner)
                        .is_some_and(|r| r.info.flags().contains(NodeFlags::FAIL));
                    if failed {
                        all_covered = false;
                        break;
                    }
                }
            }
        }
        self.health.store(all_covered, Ordering::Relaxed);
    }

    pub fn assigned_slot_count(&self) -> usize {
        (0..crate::slots::NUM_SLOTS as u16)
            .filter(|&s| self.slots.owner(s).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeAddr, NodeRole};

    fn node(id: &str, role: NodeRole) -> ClusterNode {
        ClusterNode {
            id: id.to_string(),
            addr: NodeAddr { ip: "127.0.0.1".into(), client_port: 6379, bus_port: 16379, plaintext_port: None },
            role,
            flags: if role == NodeRole::Primary { NodeFlags::PRIMARY.bits() } else { NodeFlags::REPLICA.bits() },
            replica_of: None,
            slots: Default::default(),
            config_epoch: 0,
            replication_offset: 0,
            migrating_slots: Default::default(),
            importing_slots: Default::default(),
        }
    }

    fn state() -> ClusterState {
        ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me", NodeRole::Primary))
    }

    #[test]
    fn empty_cluster_is_unhealthy() {
        let s = state();
        s.recompute_health();
        assert_eq!(s.health(), ClusterHealth::Fail);
    }

    #[test]
    fn fully_assigned_cluster_is_healthy() {
        let s = state();
        for slot in 0..crate::slots::NUM_SLOTS as u16 {
            s.slots.assign(slot, "me");
        }
        s.recompute_health();
        assert_eq!(s.health(), ClusterHealth::Ok);
    }

    #[test]
    fn failed_owner_marks_cluster_unhealthy() {
        let s = state();
        s.registry.add(node("other", NodeRole::Primary));
        for slot in 0..crate::slots::NUM_SLOTS as u16 {
            s.slots.assign(slot, "other");
        }
        s.registry.lookup_mut("other").unwrap().info.set_flags(NodeFlags::PRIMARY | NodeFlags::FAIL);
        s.recompute_health();
        assert_eq!(s.health(), ClusterHealth::Fail);
    }

    #[test]
    fn next_config_epoch_exceeds_every_known_epoch() {
        let s = state();
        s.registry.add({
            let mut n = node("other", NodeRole::Primary);
            n.config_epoch = 41;
            n
        });
        assert_eq!(s.next_config_epoch(), 42);
    }

    #[test]
    fn take_over_slots_moves_ownership_and_bumps_epoch() {
        let s = state();
        s.registry.add(node("victim", NodeRole::Primary));
        s.slots.assign(10, "victim");
        s.slots.assign(11, "victim");
        if let Some(mut v) = s.registry.lookup_mut("victim") {
            v.info.slots.insert(10);
            v.info.slots.insert(11);
        }

        s.take_over_slots_from("victim");

        assert_eq!(s.slots.owner(10).as_deref(), Some("me"));
        assert_eq!(s.slots.owner(11).as_deref(), Some("me"));
        assert!(s.registry.lookup("victim").unwrap().info.slots.is_empty());
        assert_eq!(s.registry.lookup("me").unwrap().info.config_epoch, 1);
    }

    #[test]
    fn fail_quorum_is_majority_of_online_masters() {
        let s = state();
        s.registry.add(node("m2", NodeRole::Primary));
        s.registry.add(node("m3", NodeRole::Primary));
        assert_eq!(s.fail_quorum(), 2);
    }
}
