// src/failure_detector.rs

//! The PFAIL/FAIL state machine: OK to PFAIL on ping timeout, PFAIL back to
//! OK on renewed traffic, and PFAIL to FAIL once a quorum of masters agree.
//! Grounded in the teacher's `mark_node_as_pfail`/`promote_pfail_to_fail`
//! pair, generalized to the shared `ClusterState`.

use crate::node::{NodeFlags, NodeRole};
use crate::state::ClusterState;
use std::time::{Duration, Instant};

/// FAIL is only lifted early for a replica or a master holding no slots;
/// a slotted master's FAIL flag survives until a replacement takes over its
/// slots, gated by this multiplier on the node timeout.
pub const FAIL_UNDO_TIME_MULT: u32 = 2;

/// Marks `node_id` PFAIL if its last ping has gone unanswered for longer
/// than `node_timeout`. No-op if the node is already PFAIL/FAIL or unknown.
pub fn check_ping_timeout(state: &ClusterState, node_id: &str, node_timeout: Duration) {
    let Some(mut entry) = state.registry.lookup_mut(node_id) else { return };
    if entry.info.flags().intersects(NodeFlags::PFAIL | NodeFlags::FAIL) {
        return;
    }
    let overdue = match (entry.ping_sent, entry.pong_received) {
        (Some(sent), Some(recv)) if recv >= sent => false,
        (Some(sent), _) => sent.elapsed() > node_timeout,
        _ => false,
    };
    if overdue {
        let new_flags = entry.info.flags() | NodeFlags::PFAIL;
        entry.info.set_flags(new_flags);
    }
}

/// Clears PFAIL on renewed traffic from the peer (called whenever any frame
/// is received from it).
pub fn note_traffic_received(state: &ClusterState, node_id: &str) {
    if let Some(mut entry) = state.registry.lookup_mut(node_id) {
        entry.pong_received = Some(Instant::now());
        if entry.info.flags().contains(NodeFlags::PFAIL) && !entry.info.flags().contains(NodeFlags::FAIL) {
            let new_flags = entry.info.flags() & !NodeFlags::PFAIL;
            entry.info.set_flags(new_flags);
        }
    }
}

/// Evaluates whether `node_id`'s PFAIL reports have reached quorum among
/// online masters, and if so promotes it to FAIL and returns `true`.
/// Reports from non-masters never count (data model invariant: only a
/// master's suspicion is authoritative for quorum).
pub fn promote_pfail_to_fail(state: &ClusterState, node_id: &str, report_window: Duration) -> bool {
    // Collect what's needed and release the write guard before consulting
    // the registry for other node ids, since DashMap's per-shard lock is not
    // reentrant and `node_id`/a reporter id can land in the same shard.
    let reports = {
        let Some(mut entry) = state.registry.lookup_mut(node_id) else { return false };
        if !entry.info.flags().contains(NodeFlags::PFAIL) || entry.info.flags().contains(NodeFlags::FAIL) {
            return false;
        }
        entry.purge_stale_reports(report_window);
        entry.pfail_reports.iter().map(|(r, _)| r.clone()).collect::<Vec<_>>()
    };

    let reporting_masters: std::collections::HashSet<&str> = reports
        .iter()
        .map(|r| r.as_str())
        .filter(|reporter| {
            state
                .registry
                .lookup(reporter)
                .is_some_and(|r| r.info.is_primary() && !r.info.flags().contains(NodeFlags::FAIL))
        })
        .collect();

    let self_reports_too = reports.iter().any(|r| r == &state.my_id)
        && state.registry.lookup(&state.my_id).is_some_and(|me| me.info.is_primary());
    let mut count = reporting_masters.len();
    if self_reports_too && !reporting_masters.contains(state.my_id.as_str()) {
        count += 1;
    }

    if count >= state.fail_quorum() {
        if let Some(mut entry) = state.registry.lookup_mut(node_id) {
            let new_flags = entry.info.flags() | NodeFlags::FAIL;
            entry.info.set_flags(new_flags);
            entry.fail_time = Some(Instant::now());
        }
        state.deferred.request_persist();
        state.deferred.request_health_recompute();
        true
    } else {
        false
    }
}

/// Lifts FAIL once it is safe to do so: always for replicas and zero-slot
/// masters on renewed reachability, and for slotted masters only after
/// `FAIL_UNDO_TIME_MULT * node_timeout` has elapsed without a replacement
/// taking over its slots (the stale-master edge case from the open design
/// question — see DESIGN.md).
pub fn maybe_undo_fail(state: &ClusterState, node_id: &str, node_timeout: Duration) -> bool {
    let Some(mut entry) = state.registry.lookup_mut(node_id) else { return false };
    if !entry.info.flags().contains(NodeFlags::FAIL) {
        return false;
    }
    let reachable = entry.pong_received.is_some_and(|t| t.elapsed() < node_timeout);
    if !reachable {
        return false;
    }

    let zero_slots = entry.info.slots.is_empty();
    let is_replica = entry.info.role == NodeRole::Replica;
    let grace_elapsed = entry
        .fail_time
        .is_none_or(|t| t.elapsed() > node_timeout * FAIL_UNDO_TIME_MULT);

    if is_replica || zero_slots || grace_elapsed {
        let new_flags = entry.info.flags() & !(NodeFlags::FAIL | NodeFlags::PFAIL);
        entry.info.set_flags(new_flags);
        entry.fail_time = None;
        entry.pfail_reports.clear();
        drop(entry);
        state.deferred.request_persist();
        state.deferred.request_health_recompute();
        true
    } else {
        false
    }
}
