// src/election.rs

//! Replica-initiated election and promotion. Ports the teacher's
//! `start_election`/`handle_auth_request`/`handle_auth_ack` trio, generalized
//! over `ClusterState` and carrying the manual-failover FORCEACK path.

use crate::link::LinkTable;
use crate::node::{NodeAddr, NodeFlags, NodeRole};
use crate::state::{ClusterState, ElectionRuntime};
use crate::wire::{ClusterFrame, FrameFlags, FramePayload, MessageType};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Base delay before a replica starts an election, before rank and jitter.
pub const FAILOVER_BASE_DELAY: Duration = Duration::from_millis(500);
/// Upper bound of the random jitter added on top of the base delay.
pub const FAILOVER_JITTER_MAX_MS: u64 = 500;
/// Extra delay per sibling replica with a strictly greater replication
/// offset, so the most up-to-date replica tends to win the race.
pub const FAILOVER_RANK_DELAY: Duration = Duration::from_millis(1000);

/// Tracks an in-flight election this node started as a candidate.
pub struct CandidateElection {
    pub epoch: u64,
    pub votes: AtomicU64,
    pub started_at: Instant,
}

/// Computes how long this replica should wait before starting an election
/// for `master_id`, based on its rank among siblings by replication offset.
/// A lower rank (more siblings ahead of it) means a longer wait, so the
/// freshest replica tends to start first.
pub fn election_delay(state: &ClusterState, master_id: &str, my_offset: u64, rng: &mut impl Rng) -> Duration {
    let rank = state
        .registry
        .replicas_of(master_id)
        .iter()
        .filter(|r| r.replication_offset > my_offset)
        .count() as u32;
    let jitter = Duration::from_millis(rng.gen_range(0..=FAILOVER_JITTER_MAX_MS));
    FAILOVER_BASE_DELAY + jitter + FAILOVER_RANK_DELAY * rank
}

/// Begins a new election: bumps the current epoch, records the candidacy,
/// and returns the epoch to broadcast in the AUTH_REQUEST frame.
pub fn start_election(state: &ClusterState) -> u64 {
    let epoch = state.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    state.last_vote_epoch.store(epoch, Ordering::SeqCst);
    epoch
}

/// A master's decision when it receives an AUTH_REQUEST. All six conditions
/// must hold for a vote to be granted:
/// 1. this node itself serves at least one slot (a zero-slot master's vote
///    doesn't count and isn't worth casting),
/// 2. the request's current epoch is not behind our own,
/// 3. we have not already voted in this epoch,
/// 4. the candidate's claimed master is known and currently FAILed in our
///    view, or the request carries FORCEACK (manual failover),
/// 5. we have not voted for a replica of this same master within the last
///    `2 * node_timeout`, to stop a single master's failure from burning
///    through every vote at once,
/// 6. for every slot the candidate claims, no node we currently recognize as
///    that slot's owner holds an equal-or-greater config epoch.
pub fn handle_auth_request(
    state: &ClusterState,
    candidate_id: &str,
    candidate_epoch: u64,
    candidate_slots: &BTreeSet<u16>,
    force_ack: bool,
    node_timeout: Duration,
) -> Result<(), &'static str> {
    let me = state.registry.lookup(&state.my_id).ok_or("self missing")?;
    if !me.info.is_primary() || me.info.slots.is_empty() {
        return Err("not a voting master");
    }
    drop(me);

    if candidate_epoch < state.current_epoch() {
        return Err("request epoch is behind our current epoch");
    }
    if candidate_epoch <= state.last_vote_epoch.load(Ordering::SeqCst) {
        return Err("already voted in this epoch");
    }

    let candidate = state.registry.lookup(candidate_id).ok_or("unknown candidate")?;
    if candidate.info.role != NodeRole::Replica {
        return Err("candidate is not a replica");
    }
    let Some(master_id) = candidate.info.replica_of.clone() else {
        return Err("candidate has no master");
    };
    drop(candidate);

    let master_failed = state
        .registry
        .lookup(&master_id)
        .is_some_and(|m| m.info.flags().contains(NodeFlags::FAIL));
    if !master_failed && !force_ack {
        return Err("master is not failed");
    }

    if let Some(last_vote) = state.last_vote_for_master.get(&master_id) {
        if last_vote.elapsed() < node_timeout * 2 {
            return Err("already voted for a replica of this master recently");
        }
    }

    for &slot in candidate_slots {
        if let Some(owner_id) = state.slots.owner(slot) {
            let owner_epoch = state.registry.lookup(&owner_id).map(|o| o.info.config_epoch).unwrap_or(0);
            if owner_epoch >= candidate_epoch {
                return Err("a current slot owner has an equal-or-greater config epoch");
            }
        }
    }

    state.last_vote_epoch.store(candidate_epoch, Ordering::SeqCst);
    state.last_vote_for_master.insert(master_id, Instant::now());
    state.bump_epoch_to_at_least(candidate_epoch);
    Ok(())
}

fn build_auth_frame(state: &ClusterState, msg_type: MessageType, my_addr: NodeAddr, force_ack: bool) -> ClusterFrame {
    let me = state.registry.lookup(&state.my_id).expect("self always present");
    ClusterFrame {
        msg_type,
        sender_id: state.my_id.clone(),
        sender_current_epoch: state.current_epoch(),
        sender_config_epoch: me.info.config_epoch,
        sender_repl_offset: me.info.replication_offset,
        sender_slots: me.info.slots.clone(),
        sender_master_id: me.info.replica_of.clone(),
        sender_addr: my_addr,
        sender_flags: me.info.flags(),
        sender_cluster_ok: state.health() == crate::state::ClusterHealth::Ok,
        frame_flags: if force_ack { FrameFlags::FORCEACK } else { FrameFlags::empty() },
        payload: FramePayload::AuthOnly,
    }
}

/// Broadcasts an AUTH_REQUEST to every known master, starting this replica's
/// candidacy for the epoch `start_election` minted.
pub fn broadcast_auth_request(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, force_ack: bool) {
    let frame = build_auth_frame(state, MessageType::AuthRequest, my_addr, force_ack);
    for master in state.registry.iter_with_flags(NodeFlags::PRIMARY) {
        if master.id != state.my_id {
            links.send(&master.id, frame.clone());
        }
    }
    state.counters.auth_request_sent.fetch_add(1, Ordering::Relaxed);
}

/// Sends an AUTH_ACK back to `candidate_id` once its vote has been granted.
pub fn send_auth_ack(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, candidate_id: &str, force_ack: bool) {
    let frame = build_auth_frame(state, MessageType::AuthAck, my_addr, force_ack);
    links.send(candidate_id, frame);
    state.counters.auth_ack_sent.fetch_add(1, Ordering::Relaxed);
}

/// Builds the MFSTART frame a master in manual-failover `Electing` phase
/// sends its chosen replica, telling it to start a FORCEACK election without
/// waiting for the master to actually go unreachable.
pub fn build_mfstart_frame(state: &ClusterState, my_addr: NodeAddr) -> ClusterFrame {
    build_auth_frame(state, MessageType::MfStart, my_addr, true)
}

/// Drives this node's replica-side election state machine from `cron::tick`:
/// notices a failed master, waits out the rank-based delay, then starts (and
/// retries, on timeout) an election by broadcasting AUTH_REQUEST. A no-op on
/// masters and on replicas whose master is reachable.
pub fn drive_replica(
    state: &ClusterState,
    links: &LinkTable,
    my_addr: NodeAddr,
    node_timeout: Duration,
    rng: &mut impl Rng,
) {
    let Some(me) = state.registry.lookup(&state.my_id) else { return };
    if me.info.role != NodeRole::Replica {
        return;
    }
    let Some(master_id) = me.info.replica_of.clone() else { return };
    let my_offset = me.info.replication_offset;
    drop(me);

    let master_failed = state
        .registry
        .lookup(&master_id)
        .is_some_and(|m| m.info.flags().contains(NodeFlags::FAIL) && !m.info.slots.is_empty());

    let mut runtime = state.election.lock().unwrap();

    if !master_failed {
        *runtime = ElectionRuntime::default();
        return;
    }

    if let Some(election) = &runtime.in_flight {
        let retry_timeout = (node_timeout * 2).max(Duration::from_millis(2000));
        if election.started_at.elapsed() > retry_timeout {
            runtime.in_flight = None;
            runtime.next_attempt_at = None;
        }
        return;
    }

    match runtime.next_attempt_at {
        None => {
            runtime.next_attempt_at = Some(Instant::now() + election_delay(state, &master_id, my_offset, rng));
        }
        Some(at) if Instant::now() >= at => {
            runtime.next_attempt_at = None;
            let epoch = start_election(state);
            runtime.in_flight = Some(CandidateElection { epoch, votes: AtomicU64::new(0), started_at: Instant::now() });
            drop(runtime);
            broadcast_auth_request(state, links, my_addr, false);
        }
        Some(_) => {}
    }
}

/// Records a granted vote for an in-flight election, returning `true` once
/// quorum is reached (caller should then call [`promote_to_master`]).
pub fn handle_auth_ack(state: &ClusterState, election: &CandidateElection) -> bool {
    let votes = election.votes.fetch_add(1, Ordering::SeqCst) + 1;
    votes as usize >= state.fail_quorum()
}

/// Promotes this node from replica to master, taking over the failed
/// master's slots with a config epoch that wins any conflict.
pub fn promote_to_master(state: &ClusterState, old_master_id: &str) {
    state.take_over_slots_from(old_master_id);
    if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
        me.info.role = NodeRole::Primary;
        me.info.replica_of = None;
        let new_flags = (me.info.flags() & !NodeFlags::REPLICA) | NodeFlags::PRIMARY;
        me.info.set_flags(new_flags);
    }
    if let Some(mut old_master) = state.registry.lookup_mut(old_master_id) {
        let new_flags = old_master.info.flags() & !(NodeFlags::PRIMARY);
        old_master.info.set_flags(new_flags);
        old_master.info.role = NodeRole::Replica;
        old_master.info.replica_of = Some(state.my_id.clone());
    }
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
}

/// Resolves a config-epoch collision between two nodes that both claim the
/// same epoch: the lexicographically smaller node id loses and bumps its own
/// epoch past the current maximum, guaranteeing a unique total order without
/// any coordinator.
pub fn resolve_epoch_collision(state: &ClusterState, other_id: &str, other_epoch: u64) {
    let my_epoch = state.registry.lookup(&state.my_id).map(|m| m.info.config_epoch).unwrap_or(0);
    if my_epoch != other_epoch {
        return;
    }
    if state.my_id.as_str() < other_id {
        let new_epoch = state.next_config_epoch();
        if let Some(mut me) = state.registry.lookup_mut(&state.my_id) {
            me.info.config_epoch = new_epoch;
        }
        state.deferred.request_persist();
    }
}
