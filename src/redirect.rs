// src/redirect.rs

//! The client redirector: turns a set of keys plus cluster state into either
//! a go-ahead to serve the command locally or one of the standard
//! redirection/rejection errors.

use crate::errors::ClusterError;
use crate::node::NodeFlags;
use crate::slots::key_slot;
use crate::state::{ClusterHealth, ClusterState};

/// The outcome of routing a command's keys against the local node's slot
/// ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Serve the command locally.
    Serve,
    /// Serve locally even though this node does not own the slot, because
    /// the client sent `ASKING` immediately before and the slot is being
    /// imported here.
    ServeAsking,
}

/// Determines every key's slot and verifies they all agree, per `CROSSSLOT`.
/// Returns the common slot on success.
pub fn extract_common_slot(keys: &[&[u8]]) -> Result<u16, ClusterError> {
    let mut slot = None;
    for key in keys {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(existing) if existing != s => return Err(ClusterError::CrossSlot),
            _ => {}
        }
    }
    slot.ok_or_else(|| ClusterError::Invariant("command carries no keys to route".into()))
}

/// Routes a command whose keys all hash to `slot`, given whether the client
/// connection most recently sent `ASKING`, whether it is flagged `READONLY`
/// (replicas only serve reads for owned-by-master slots when this is set),
/// and whether every key the command touches is physically present on this
/// node right now (the caller checks the keyspace; this crate doesn't own
/// it) — the deciding factor for the migrating-out ASK branch.
pub fn route(
    state: &ClusterState,
    slot: u16,
    client_sent_asking: bool,
    client_is_readonly: bool,
    command_is_write: bool,
    key_present_locally: bool,
) -> Result<RoutingDecision, ClusterError> {
    if !state.config.enabled {
        return Err(ClusterError::NotEnabled);
    }

    if state.health() != ClusterHealth::Ok {
        // A master missing slot coverage blocks everything; if only writes
        // are affected because *we* lack replicas, CLUSTERDOWN-RO covers the
        // read-only-safe subset. Simplify to the common case: full down.
        return Err(ClusterError::ClusterDown(format!("Hash slot {slot} not served")));
    }

    if state.i_own_slot(slot) {
        // Check the migrating-out side channel before the ownership
        // short-circuit: a key we're migrating away and no longer hold
        // locally must ASK to the destination even though the slot table
        // still names us as owner.
        if state.slots.migrating_to(slot).is_some() && !key_present_locally {
            return Err(ask_redirect(state, slot)?);
        }
        return Ok(RoutingDecision::Serve);
    }

    // Not locally owned outright; check migration/import side channels.
    if let Some(_importing_from) = state.slots.importing_from(slot) {
        if client_sent_asking {
            return Ok(RoutingDecision::ServeAsking);
        }
        // Importing but client didn't ask: fall through to MOVED, since the
        // canonical owner (per the slot table) is still elsewhere.
    }

    let Some(owner) = state.node_for_slot(slot) else {
        return Err(ClusterError::ClusterDown(format!("Hash slot {slot} not served")));
    };

    // If we are a replica of the owning master and the client asked for a
    // read-only connection, serve locally instead of redirecting.
    if client_is_readonly && !command_is_write {
        if let Some(me) = state.registry.lookup(&state.my_id) {
            if me.info.replica_of.as_deref() == Some(owner.id.as_str()) {
                return Ok(RoutingDecision::Serve);
            }
        }
    }

    Err(ClusterError::Moved { slot, addr: owner.addr.client_addr() })
}

/// Builds the ASK redirection for a key this node is actively migrating out
/// and no longer holds, per the migrating-slot branch of the decision tree.
pub fn ask_redirect(state: &ClusterState, slot: u16) -> Result<ClusterError, ClusterError> {
    let dest_id = state
        .slots
        .migrating_to(slot)
        .ok_or_else(|| ClusterError::Invariant(format!("slot {slot} is not migrating")))?;
    let dest = state
        .registry
        .lookup(&dest_id)
        .ok_or_else(|| ClusterError::UnknownNode(dest_id.clone()))?;
    Ok(ClusterError::Ask { slot, addr: dest.info.addr.client_addr() })
}

/// `true` if this node's cluster view is healthy enough to accept writes,
/// used to distinguish `CLUSTERDOWN` from the read-only-tolerant
/// `CLUSTERDOWN-RO` variant.
pub fn writes_allowed(state: &ClusterState) -> bool {
    state.health() == ClusterHealth::Ok
        && state
            .registry
            .lookup(&state.my_id)
            .is_some_and(|me| !me.info.flags().contains(NodeFlags::FAIL))
}
