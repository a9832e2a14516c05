// src/cron.rs

//! The cron driver: the 10 Hz tick that ties every other component
//! together. Mirrors the teacher's `handle_failover_cron`/gossip `run` loop
//! shape, but as a single scheduled function the caller drives from its own
//! `tokio::time::interval`, rather than owning its own task loop, so the
//! embedding application controls shutdown.

use crate::election;
use crate::failure_detector;
use crate::gossip::{self, GOSSIP_PROBE_INTERVAL};
use crate::link::LinkTable;
use crate::manual_failover;
use crate::node::{NodeAddr, NodeFlags};
use crate::persistence;
use crate::state::ClusterState;
use lru::LruCache;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cron tick frequency, matching the gossip engine's own cadence.
pub const CRON_INTERVAL: Duration = Duration::from_millis(100);
/// Handshake entries older than this without completing are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Idle eviction window for cached migration sockets.
pub const MIGRATION_SOCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Capacity of the migration socket cache.
const MIGRATION_SOCKET_CACHE_SIZE: usize = 64;

struct CachedSocket {
    #[allow(dead_code)]
    addr: String,
    last_used: Instant,
}

/// LRU cache of open sockets to migration-destination nodes, so `MIGRATE`
/// doesn't pay a fresh TCP handshake per key during a large reshard.
pub struct MigrationSocketCache {
    inner: Mutex<LruCache<String, CachedSocket>>,
}

impl MigrationSocketCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(LruCache::new(NonZeroUsize::new(MIGRATION_SOCKET_CACHE_SIZE).unwrap())) }
    }

    pub fn touch(&self, addr: &str) {
        let mut cache = self.inner.lock().unwrap();
        cache.put(addr.to_string(), CachedSocket { addr: addr.to_string(), last_used: Instant::now() });
    }

    /// Evicts entries idle longer than [`MIGRATION_SOCKET_IDLE_TIMEOUT`].
    pub fn sweep_idle(&self) {
        let mut cache = self.inner.lock().unwrap();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, v)| v.last_used.elapsed() > MIGRATION_SOCKET_IDLE_TIMEOUT)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MigrationSocketCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the cron tick needs beyond `ClusterState` itself.
pub struct CronContext {
    pub links: LinkTable,
    pub migration_sockets: MigrationSocketCache,
    pub nodes_conf_path: Option<PathBuf>,
    rng: Mutex<SmallRng>,
    last_probe: Mutex<Instant>,
    last_migration_sweep: Mutex<Instant>,
}

impl CronContext {
    pub fn new(nodes_conf_path: Option<PathBuf>) -> Self {
        Self {
            links: LinkTable::new(),
            migration_sockets: MigrationSocketCache::new(),
            nodes_conf_path,
            rng: Mutex::new(SmallRng::from_entropy()),
            last_probe: Mutex::new(Instant::now() - GOSSIP_PROBE_INTERVAL),
            last_migration_sweep: Mutex::new(Instant::now()),
        }
    }
}

/// Drops handshake entries that never completed within [`HANDSHAKE_TIMEOUT`],
/// returning the count removed.
fn expire_stale_handshakes(state: &ClusterState) -> usize {
    let stale: Vec<String> = state
        .registry
        .iter()
        .filter(|e| e.value().info.flags().contains(NodeFlags::HANDSHAKE))
        .filter(|e| e.value().ping_sent.is_none_or(|t| t.elapsed() > HANDSHAKE_TIMEOUT))
        .map(|e| e.key().clone())
        .collect();
    for id in &stale {
        state.registry.remove(id, &state.slots);
    }
    stale.len()
}

/// Drives replica migration toward masters running below
/// `config.migration_barrier` healthy replicas: a replica of an
/// over-replicated master re-parents itself to the weakest master, so
/// failover coverage stays balanced across the cluster.
fn drive_replica_migration(state: &ClusterState) {
    if !state.config.replica_auto_failover {
        return;
    }
    let me = state.registry.lookup(&state.my_id);
    let Some(me) = me else { return };
    if !matches!(me.info.role, crate::node::NodeRole::Replica) {
        return;
    }
    let Some(my_master) = me.info.replica_of.clone() else { return };
    drop(me);

    let my_master_replica_count = state.registry.replicas_of(&my_master).len();
    if my_master_replica_count <= state.config.migration_barrier as usize {
        return; // my master isn't over-provisioned, nothing to do
    }

    let weakest = state
        .registry
        .iter_with_flags(NodeFlags::PRIMARY)
        .into_iter()
        .filter(|n| !n.slots.is_empty())
        .filter(|n| !n.flags().contains(NodeFlags::FAIL))
        .min_by_key(|n| state.registry.replicas_of(&n.id).len());

    if let Some(target) = weakest {
        if target.id != my_master && state.registry.replicas_of(&target.id).is_empty() {
            if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
                me.info.replica_of = Some(target.id.clone());
            }
            info!(new_master = %target.id, "migrating replica toward an under-replicated master");
            state.deferred.request_persist();
        }
    }
}

/// Runs one cron tick. `my_addr` is this node's announced address, needed to
/// stamp outgoing gossip frames.
pub fn tick(state: &ClusterState, ctx: &CronContext, my_addr: &NodeAddr) {
    let node_timeout = state.config.node_timeout();

    expire_stale_handshakes(state);

    let peer_ids: Vec<String> = state
        .registry
        .iter()
        .map(|e| e.key().clone())
        .filter(|id| id != &state.my_id)
        .collect();
    for id in &peer_ids {
        failure_detector::check_ping_timeout(state, id, node_timeout);
        if failure_detector::promote_pfail_to_fail(state, id, node_timeout * 2) {
            warn!(node = %id, "node promoted to FAIL by quorum");
        }
        failure_detector::maybe_undo_fail(state, id, node_timeout);
    }

    {
        let mut last_probe = ctx.last_probe.lock().unwrap();
        if last_probe.elapsed() >= GOSSIP_PROBE_INTERVAL {
            *last_probe = Instant::now();
            let mut rng = ctx.rng.lock().unwrap();
            let targets = gossip::choose_nodes_to_ping(state, node_timeout, &mut rng);
            for target in targets {
                gossip::send_ping(state, &ctx.links, my_addr.clone(), &target, &mut rng);
            }
        }
    }

    {
        let mut rng = ctx.rng.lock().unwrap();
        election::drive_replica(state, &ctx.links, my_addr.clone(), node_timeout, &mut *rng);
    }
    manual_failover::drive(state, &ctx.links, my_addr.clone());

    drive_replica_migration(state);
    state.blacklist.sweep();

    {
        let mut last_sweep = ctx.last_migration_sweep.lock().unwrap();
        if last_sweep.elapsed() >= MIGRATION_SOCKET_IDLE_TIMEOUT {
            *last_sweep = Instant::now();
            ctx.migration_sockets.sweep_idle();
        }
    }

    if state.deferred.take_health_recompute() {
        state.recompute_health();
    }

    if state.deferred.take_persist() {
        if let Some(path) = &ctx.nodes_conf_path {
            let text = persistence::serialize(&state.registry, state.current_epoch(), state.last_vote_epoch.load(std::sync::atomic::Ordering::SeqCst));
            if let Err(err) = persistence::write_atomic(path, &text) {
                warn!(error = %err, "failed to persist nodes.conf");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::{ClusterNode, NodeRole};

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

    fn my_addr() -> NodeAddr {
        NodeAddr { ip: "127.0.0.1".into(), client_port: 6379, bus_port: 16379, plaintext_port: None }
    }

    #[test]
    fn tick_expires_stale_handshakes() {
        let state = ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me", NodeRole::Primary));
        let mut handshake = node("ghost", NodeRole::Primary);
        handshake.flags = NodeFlags::HANDSHAKE.bits();
        state.registry.add(handshake);
        {
            let mut entry = state.registry.lookup_mut("ghost").unwrap();
            entry.ping_sent = Some(Instant::now() - Duration::from_secs(120));
        }
        let ctx = CronContext::new(None);
        tick(&state, &ctx, &my_addr());
        assert!(!state.registry.contains("ghost"));
    }

    #[test]
    fn migration_socket_cache_evicts_idle_entries() {
        let cache = MigrationSocketCache::new();
        cache.touch("10.0.0.1:7000");
        assert_eq!(cache.len(), 1);
        {
            let mut inner = cache.inner.lock().unwrap();
            if let Some(entry) = inner.get_mut("10.0.0.1:7000") {
                entry.last_used = Instant::now() - Duration::from_secs(60);
            }
        }
        cache.sweep_idle();
        assert!(cache.is_empty());
    }

    #[test]
    fn tick_persists_when_deferred_flag_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.conf");
        let state = ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me", NodeRole::Primary));
        state.deferred.request_persist();
        let ctx = CronContext::new(Some(path.clone()));
        tick(&state, &ctx, &my_addr());
        assert!(path.exists());
    }
}
