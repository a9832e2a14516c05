// src/command.rs

//! The typed `CLUSTER` command surface: a small dispatch layer over
//! `ClusterState`, mirroring the teacher's `ClusterSubcommand`/`ClusterInfo`
//! pattern from its command layer so an embedding RESP server can expose
//! `CLUSTER INFO`/`NODES`/`SLOTS`/`RESET`/etc. without reaching into
//! internals directly.

use crate::errors::ClusterError;
use crate::node::{ClusterNode, NodeFlags, NodeRole};
use crate::persistence;
use crate::state::{ClusterHealth, ClusterState};
use std::collections::BTreeSet;

/// Hook into whatever owns the actual keyspace, so `CLUSTER
/// COUNTKEYSINSLOT`/`GETKEYSINSLOT` can be answered without this crate
/// depending on a storage engine.
pub trait KeyspaceQuery {
    fn count_keys_in_slot(&self, slot: u16) -> u64;
    fn keys_in_slot(&self, slot: u16, limit: usize) -> Vec<Vec<u8>>;
}

/// The subset of `CLUSTER` subcommands this crate answers directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    Info,
    Nodes,
    Slots,
    Shards,
    MyId,
    KeySlot { key: Vec<u8> },
    CountKeysInSlot { slot: u16 },
    GetKeysInSlot { slot: u16, count: usize },
    AddSlots { slots: Vec<u16> },
    DelSlots { slots: Vec<u16> },
    SetSlot { slot: u16, action: SetSlotAction },
    Forget { node_id: String },
    Meet { ip: String, port: u16, bus_port: Option<u16> },
    Replicate { master_id: String },
    Failover { force_ack: bool },
    Reset { hard: bool },
    FlushSlots,
    SetConfigEpoch { epoch: u64 },
    BumpEpoch,
}

/// Per-connection flags a RESP server tracks alongside a `ClusterCommand`
/// dispatch: `READONLY`/`READWRITE` toggle whether reads may be served from a
/// replica, `ASKING` is a one-shot flag consumed by the very next command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    pub readonly: bool,
    asking: bool,
}

impl ConnectionFlags {
    pub fn set_readonly(&mut self, on: bool) {
        self.readonly = on;
    }

    pub fn set_asking(&mut self) {
        self.asking = true;
    }

    /// Consumes the one-shot `ASKING` flag, returning whether it was set.
    pub fn take_asking(&mut self) -> bool {
        std::mem::take(&mut self.asking)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotAction {
    Migrating { dest_id: String },
    Importing { source_id: String },
    Node { node_id: String },
    Stable,
}

/// The reply to `CLUSTER INFO`, field-for-field compatible with standard
/// Redis Cluster's plain-text report.
#[derive(Debug, Clone)]
pub struct ClusterInfoReport {
    pub cluster_enabled: bool,
    pub cluster_state: &'static str,
    pub cluster_slots_assigned: usize,
    pub cluster_slots_ok: usize,
    pub cluster_slots_pfail: usize,
    pub cluster_slots_fail: usize,
    pub cluster_known_nodes: usize,
    pub cluster_size: usize,
    pub cluster_current_epoch: u64,
    pub cluster_my_epoch: u64,
    pub cluster_stats_messages_sent: u64,
    pub cluster_stats_messages_received: u64,
}

impl ClusterInfoReport {
    /// Renders in the `key:value\r\n`-per-line format clients expect.
    pub fn to_wire_text(&self) -> String {
        format!(
            "cluster_enabled:{}\r\ncluster_state:{}\r\ncluster_slots_assigned:{}\r\ncluster_slots_ok:{}\r\ncluster_slots_pfail:{}\r\ncluster_slots_fail:{}\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\ncluster_current_epoch:{}\r\ncluster_my_epoch:{}\r\ncluster_stats_messages_sent:{}\r\ncluster_stats_messages_received:{}\r\n",
            self.cluster_enabled as u8,
            self.cluster_state,
            self.cluster_slots_assigned,
            self.cluster_slots_ok,
            self.cluster_slots_pfail,
            self.cluster_slots_fail,
            self.cluster_known_nodes,
            self.cluster_size,
            self.cluster_current_epoch,
            self.cluster_my_epoch,
            self.cluster_stats_messages_sent,
            self.cluster_stats_messages_received,
        )
    }
}

pub fn build_info_report(state: &ClusterState) -> ClusterInfoReport {
    let mut slots_pfail = 0usize;
    let mut slots_fail = 0usize;
    let mut slots_ok = 0usize;
    let mut assigned = 0usize;
    for slot in 0..crate::slots::NUM_SLOTS as u16 {
        if let Some(owner) = state.slots.owner(slot) {
            assigned += 1;
            let flags = state.registry.lookup(&owner).map(|r| r.info.flags()).unwrap_or(NodeFlags::empty());
            if flags.contains(NodeFlags::FAIL) {
                slots_fail += 1;
            } else if flags.contains(NodeFlags::PFAIL) {
                slots_pfail += 1;
            } else {
                slots_ok += 1;
            }
        }
    }
    let my_epoch = state.registry.lookup(&state.my_id).map(|m| m.info.config_epoch).unwrap_or(0);
    let cluster_size = state
        .registry
        .iter_with_flags(NodeFlags::PRIMARY)
        .into_iter()
        .filter(|n| !n.slots.is_empty())
        .count();

    ClusterInfoReport {
        cluster_enabled: state.config.enabled,
        cluster_state: if state.health() == ClusterHealth::Ok { "ok" } else { "fail" },
        cluster_slots_assigned: assigned,
        cluster_slots_ok: slots_ok,
        cluster_slots_pfail: slots_pfail,
        cluster_slots_fail: slots_fail,
        cluster_known_nodes: state.registry.len(),
        cluster_size,
        cluster_current_epoch: state.current_epoch(),
        cluster_my_epoch: my_epoch,
        cluster_stats_messages_sent: state.counters.total_sent(),
        cluster_stats_messages_received: state.counters.total_received(),
    }
}

/// `CLUSTER NODES`: one line per known node via [`persistence::serialize`],
/// minus the trailing `vars` line (that's a `nodes.conf`-only artifact).
pub fn build_nodes_report(state: &ClusterState) -> String {
    let full = persistence::serialize(&state.registry, state.current_epoch(), state.last_vote_epoch.load(std::sync::atomic::Ordering::SeqCst));
    full.lines().filter(|l| !l.starts_with("vars ")).collect::<Vec<_>>().join("\n") + "\n"
}

/// `CLUSTER SLOTS`: `(start, end, [ip, port, id])` triples per contiguous
/// range this node knows about, master first then replicas.
pub fn build_slots_report(state: &ClusterState) -> Vec<(u16, u16, Vec<(String, u16, String)>)> {
    let mut report = Vec::new();
    for master in state.registry.iter_with_flags(NodeFlags::PRIMARY) {
        if master.slots.is_empty() {
            continue;
        }
        for (start, end) in state.slots.owned_ranges(&master.id) {
            let mut endpoints = vec![(master.addr.ip.clone(), master.addr.client_port, master.id.clone())];
            for replica in state.registry.replicas_of(&master.id) {
                endpoints.push((replica.addr.ip.clone(), replica.addr.client_port, replica.id.clone()));
            }
            report.push((start, end, endpoints));
        }
    }
    report
}

/// Assigns `slots` to this node, failing if any are already owned elsewhere.
pub fn add_slots(state: &ClusterState, slots: &[u16]) -> Result<(), ClusterError> {
    for &slot in slots {
        if slot as usize >= crate::slots::NUM_SLOTS {
            return Err(ClusterError::InvalidSlot(slot as u32));
        }
        if let Some(owner) = state.slots.owner(slot) {
            if owner != state.my_id {
                return Err(ClusterError::SlotAlreadyOwned(slot));
            }
        }
    }
    for &slot in slots {
        state.slots.assign(slot, &state.my_id);
    }
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        me.info.slots.extend(slots.iter().copied());
    }
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
    Ok(())
}

pub fn del_slots(state: &ClusterState, slots: &[u16]) -> Result<(), ClusterError> {
    for &slot in slots {
        state.slots.unassign(slot);
    }
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        for slot in slots {
            me.info.slots.remove(slot);
        }
    }
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
    Ok(())
}

/// `CLUSTER FORGET`: removes a node and blacklists it so gossip can't
/// silently re-admit it before the removal has propagated cluster-wide.
pub fn forget(state: &ClusterState, node_id: &str) -> Result<(), ClusterError> {
    if node_id == state.my_id {
        return Err(ClusterError::Invariant("a node cannot forget itself".into()));
    }
    let has_slots = state.registry.lookup(node_id).is_some_and(|n| !n.info.slots.is_empty());
    if has_slots {
        return Err(ClusterError::NodeBusy(node_id.to_string()));
    }
    if state.registry.remove(node_id, &state.slots).is_none() {
        return Err(ClusterError::UnknownNode(node_id.to_string()));
    }
    state.blacklist.add(node_id);
    state.deferred.request_persist();
    Ok(())
}

/// `CLUSTER RESET`: `SOFT` clears vote/epoch state and forgets every other
/// node; `HARD` additionally assigns this node a fresh random id and drops
/// the slots it owns.
pub fn reset(state: &ClusterState, hard: bool) {
    let other_ids: Vec<String> = state
        .registry
        .iter()
        .map(|e| e.key().clone())
        .filter(|id| id != &state.my_id)
        .collect();
    for id in other_ids {
        state.registry.remove(&id, &state.slots);
    }
    state.last_vote_epoch.store(0, std::sync::atomic::Ordering::SeqCst);
    state.current_epoch.store(0, std::sync::atomic::Ordering::SeqCst);

    if hard {
        let owned: Vec<u16> = (0..crate::slots::NUM_SLOTS as u16).filter(|&s| state.i_own_slot(s)).collect();
        for slot in owned {
            state.slots.unassign(slot);
        }
        if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
            me.info.slots = BTreeSet::new();
            me.info.config_epoch = 0;
            me.info.role = NodeRole::Primary;
            me.info.replica_of = None;
        }
    }
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
}

/// `CLUSTER SETSLOT`: applies one of the four side-channel transitions
/// (`MIGRATING`/`IMPORTING`/`STABLE`/`NODE`) for a single slot.
pub fn apply_set_slot(state: &ClusterState, slot: u16, action: SetSlotAction) -> Result<(), ClusterError> {
    if slot as usize >= crate::slots::NUM_SLOTS {
        return Err(ClusterError::InvalidSlot(slot as u32));
    }
    match action {
        SetSlotAction::Migrating { dest_id } => {
            if !state.i_own_slot(slot) {
                return Err(ClusterError::Invariant(format!("cannot migrate slot {slot} we do not own")));
            }
            if !state.registry.contains(&dest_id) {
                return Err(ClusterError::UnknownNode(dest_id));
            }
            state.slots.set_migrating_to(slot, Some(dest_id.clone()));
            if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
                me.info.migrating_slots.insert(slot, dest_id);
            }
        }
        SetSlotAction::Importing { source_id } => {
            if state.i_own_slot(slot) {
                return Err(ClusterError::Invariant(format!("cannot import slot {slot} we already own")));
            }
            if !state.registry.contains(&source_id) {
                return Err(ClusterError::UnknownNode(source_id));
            }
            state.slots.set_importing_from(slot, Some(source_id.clone()));
            if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
                me.info.importing_slots.insert(slot, source_id);
            }
        }
        SetSlotAction::Stable => {
            state.slots.set_migrating_to(slot, None);
            state.slots.set_importing_from(slot, None);
            if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
                me.info.migrating_slots.remove(&slot);
                me.info.importing_slots.remove(&slot);
            }
        }
        SetSlotAction::Node { node_id } => {
            if let Some(prev_owner) = state.slots.owner(slot) {
                if prev_owner != node_id {
                    if let Some(mut prev) = state.registry.lookup_mut(&prev_owner) {
                        prev.info.slots.remove(&slot);
                    }
                }
            }
            if !state.registry.contains(&node_id) {
                return Err(ClusterError::UnknownNode(node_id));
            }
            state.slots.assign(slot, &node_id);
            state.slots.set_migrating_to(slot, None);
            state.slots.set_importing_from(slot, None);
            if let Some(mut owner) = state.registry.lookup_mut(&node_id) {
                owner.info.slots.insert(slot);
                owner.info.migrating_slots.remove(&slot);
                owner.info.importing_slots.remove(&slot);
            }
        }
    }
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
    Ok(())
}

/// `CLUSTER FLUSHSLOTS`: drops every slot this node owns, refusing if any of
/// them still hold keys.
pub fn flush_slots(state: &ClusterState, keyspace: &dyn KeyspaceQuery) -> Result<(), ClusterError> {
    let owned: Vec<u16> = state
        .registry
        .lookup(&state.my_id)
        .map(|m| m.info.slots.iter().copied().collect())
        .unwrap_or_default();
    for &slot in &owned {
        if keyspace.count_keys_in_slot(slot) > 0 {
            return Err(ClusterError::NodeBusy(state.my_id.clone()));
        }
    }
    del_slots(state, &owned)
}

/// `CLUSTER SET-CONFIG-EPOCH`: a one-time stamp for a freshly reset node,
/// refusing once the node already carries a non-zero epoch.
pub fn set_config_epoch(state: &ClusterState, epoch: u64) -> Result<(), ClusterError> {
    let current = state.registry.lookup(&state.my_id).map(|m| m.info.config_epoch).unwrap_or(0);
    if current != 0 {
        return Err(ClusterError::Invariant("config epoch already set".into()));
    }
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        me.info.config_epoch = epoch;
    }
    state.bump_epoch_to_at_least(epoch);
    state.deferred.request_persist();
    Ok(())
}

/// `CLUSTER BUMPEPOCH`: mints and adopts the next free config epoch.
pub fn bump_epoch(state: &ClusterState) -> u64 {
    let next = state.next_config_epoch();
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        me.info.config_epoch = next;
    }
    state.deferred.request_persist();
    next
}

/// `CLUSTER MEET`: registers a provisional handshake entry for a newly
/// introduced peer; its real identity and state arrive in the first PONG.
pub fn meet(state: &ClusterState, ip: &str, port: u16, bus_port: Option<u16>) -> Result<(), ClusterError> {
    let provisional_id = crate::generate_node_id();
    let bus_port = bus_port.unwrap_or_else(|| port.wrapping_add(state.config.bus_port_offset));
    state.registry.add(ClusterNode {
        id: provisional_id,
        addr: crate::node::NodeAddr { ip: ip.to_string(), client_port: port, bus_port, plaintext_port: None },
        role: NodeRole::Primary,
        flags: NodeFlags::HANDSHAKE.bits(),
        replica_of: None,
        slots: Default::default(),
        config_epoch: 0,
        replication_offset: 0,
        migrating_slots: Default::default(),
        importing_slots: Default::default(),
    });
    state.deferred.request_persist();
    Ok(())
}

/// `CLUSTER REPLICATE`: turns this node into a replica of `master_id`,
/// refusing if it still owns slots of its own.
pub fn replicate(state: &ClusterState, master_id: &str) -> Result<(), ClusterError> {
    if !state.registry.contains(master_id) {
        return Err(ClusterError::UnknownNode(master_id.to_string()));
    }
    let has_slots = state.registry.lookup(&state.my_id).is_some_and(|m| !m.info.slots.is_empty());
    if has_slots {
        return Err(ClusterError::NodeBusy(state.my_id.clone()));
    }
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        me.info.role = NodeRole::Replica;
        me.info.replica_of = Some(master_id.to_string());
        let new_flags = (me.info.flags() & !NodeFlags::PRIMARY) | NodeFlags::REPLICA;
        me.info.set_flags(new_flags);
    }
    state.deferred.request_persist();
    Ok(())
}

/// `CLUSTER FAILOVER`: starts the manual failover handshake and stashes its
/// state on `ClusterState` so `manual_failover::drive` can step it from cron.
pub fn start_manual_failover(state: &ClusterState, force: bool) -> Result<(), ClusterError> {
    let _ = force;
    let mf = crate::manual_failover::start(state).map_err(|e| ClusterError::Invariant(e.to_string()))?;
    *state.manual_failover.lock().unwrap() = Some(mf);
    Ok(())
}

/// The typed reply a `dispatch` call produces, one variant per response
/// shape the `CLUSTER` command family needs.
#[derive(Debug, Clone)]
pub enum ClusterCommandReply {
    Info(ClusterInfoReport),
    Text(String),
    Slots(Vec<(u16, u16, Vec<(String, u16, String)>)>),
    Slot(u16),
    Count(u64),
    Keys(Vec<Vec<u8>>),
    Ok,
}

/// The single entry point a RESP server calls to execute a parsed
/// `ClusterCommand` against `ClusterState`.
pub fn dispatch(
    state: &ClusterState,
    keyspace: &dyn KeyspaceQuery,
    command: ClusterCommand,
) -> Result<ClusterCommandReply, ClusterError> {
    match command {
        ClusterCommand::Info => Ok(ClusterCommandReply::Info(build_info_report(state))),
        ClusterCommand::Nodes => Ok(ClusterCommandReply::Text(build_nodes_report(state))),
        ClusterCommand::Slots => Ok(ClusterCommandReply::Slots(build_slots_report(state))),
        ClusterCommand::Shards => Ok(ClusterCommandReply::Slots(build_slots_report(state))),
        ClusterCommand::MyId => Ok(ClusterCommandReply::Text(state.my_id.clone())),
        ClusterCommand::KeySlot { key } => Ok(ClusterCommandReply::Slot(crate::slots::key_slot(&key))),
        ClusterCommand::CountKeysInSlot { slot } => Ok(ClusterCommandReply::Count(keyspace.count_keys_in_slot(slot))),
        ClusterCommand::GetKeysInSlot { slot, count } => {
            Ok(ClusterCommandReply::Keys(keyspace.keys_in_slot(slot, count)))
        }
        ClusterCommand::AddSlots { slots } => add_slots(state, &slots).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::DelSlots { slots } => del_slots(state, &slots).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::FlushSlots => flush_slots(state, keyspace).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::SetSlot { slot, action } => apply_set_slot(state, slot, action).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::Forget { node_id } => forget(state, &node_id).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::Meet { ip, port, bus_port } => meet(state, &ip, port, bus_port).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::Replicate { master_id } => replicate(state, &master_id).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::Failover { force_ack } => start_manual_failover(state, force_ack).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::Reset { hard } => {
            reset(state, hard);
            Ok(ClusterCommandReply::Ok)
        }
        ClusterCommand::SetConfigEpoch { epoch } => set_config_epoch(state, epoch).map(|_| ClusterCommandReply::Ok),
        ClusterCommand::BumpEpoch => {
            bump_epoch(state);
            Ok(ClusterCommandReply::Ok)
        }
    }
}
