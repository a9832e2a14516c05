// src/dispatch.rs

//! The inbound frame dispatcher: drains frames `link.rs` hands off over its
//! `inbound` channel and routes each to the component that owns its
//! semantics. Grounded on the teacher's `handle_gossip_message` in
//! `gossip.rs`, which matches on `GossipMessage::{Meet, Ping, Pong,
//! FailoverAuthRequest, FailoverAuthAck}` and calls into the corresponding
//! state-machine function — generalized here over the wider `MessageType`
//! set this crate's wire codec carries.

use crate::election;
use crate::failure_detector;
use crate::gossip;
use crate::link::LinkTable;
use crate::node::{ClusterNode, NodeAddr, NodeFlags, NodeRole};
use crate::state::ClusterState;
use crate::wire::{ClusterFrame, FrameFlags, FramePayload, MessageType};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Runs until `inbound` closes, handing every received frame to
/// [`handle_inbound_frame`]. The long-lived counterpart of the teacher's
/// `gossip::run()` select loop, specialized to just the dispatch half (the
/// send half lives in `cron::tick`/`gossip::send_*`).
pub async fn run_dispatcher(
    state: Arc<ClusterState>,
    links: Arc<LinkTable>,
    my_addr: NodeAddr,
    mut inbound: mpsc::UnboundedReceiver<ClusterFrame>,
) {
    while let Some(frame) = inbound.recv().await {
        handle_inbound_frame(&state, &links, my_addr.clone(), frame);
    }
}

/// Applies one decoded frame's effects to `state`, replying over `links`
/// where the message type calls for an immediate reply.
pub fn handle_inbound_frame(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, frame: ClusterFrame) {
    failure_detector::note_traffic_received(state, &frame.sender_id);

    match frame.msg_type {
        MessageType::Ping => {
            apply_gossip_payload(state, &frame);
            state.counters.ping_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut rng = SmallRng::from_entropy();
            gossip::send_pong(state, links, my_addr, &frame.sender_id, &mut rng);
        }
        MessageType::Pong => {
            apply_gossip_payload(state, &frame);
            state.counters.pong_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            apply_manual_failover_progress(state, &frame);
        }
        MessageType::Meet => {
            apply_gossip_payload(state, &frame);
            ensure_node_known(state, &frame);
            state.counters.meet_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut rng = SmallRng::from_entropy();
            gossip::send_pong(state, links, my_addr, &frame.sender_id, &mut rng);
        }
        MessageType::Fail => {
            if let FramePayload::Fail { node_id } = &frame.payload {
                apply_fail_report(state, node_id);
            }
            state.counters.fail_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        MessageType::Publish => {
            // Pub/sub fan-out belongs to the embedding RESP server's own
            // channel registry, which this crate doesn't own; just count it.
            state.counters.publish_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        MessageType::AuthRequest => {
            state.counters.auth_request_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            handle_auth_request_frame(state, links, my_addr, &frame);
        }
        MessageType::AuthAck => {
            state.counters.auth_ack_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            handle_auth_ack_frame(state, &frame);
        }
        MessageType::MfStart => {
            handle_mfstart_frame(state, links, my_addr, &frame);
        }
        MessageType::Update => {
            if let FramePayload::Update { node_id, config_epoch, slots } = &frame.payload {
                apply_update(state, node_id, *config_epoch, slots);
            }
            state.counters.update_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        MessageType::Module => {
            debug!(sender = %frame.sender_id, "ignoring module message, no module subsystem registered");
        }
    }
}

/// Applies every digest piggybacked on a PING/PONG/MEET frame, and notes the
/// sender's own header fields (config epoch collision check).
fn apply_gossip_payload(state: &ClusterState, frame: &ClusterFrame) {
    if let FramePayload::Gossip(digests) = &frame.payload {
        for digest in digests {
            gossip::apply_digest(state, &frame.sender_id, digest);
        }
    }
    election::resolve_epoch_collision(state, &frame.sender_id, frame.sender_config_epoch);
}

/// Registers a never-before-seen sender so a MEET handshake always has
/// something to reply PONG to, even before any gossip digest names it.
fn ensure_node_known(state: &ClusterState, frame: &ClusterFrame) {
    if frame.sender_id == state.my_id || state.registry.contains(&frame.sender_id) {
        return;
    }
    if state.blacklist.contains(&frame.sender_id) {
        return;
    }
    state.registry.add(ClusterNode {
        id: frame.sender_id.clone(),
        addr: frame.sender_addr.clone(),
        role: if frame.sender_master_id.is_some() { NodeRole::Replica } else { NodeRole::Primary },
        flags: NodeFlags::empty().bits(),
        replica_of: frame.sender_master_id.clone(),
        slots: frame.sender_slots.clone(),
        config_epoch: frame.sender_config_epoch,
        replication_offset: frame.sender_repl_offset,
        migrating_slots: Default::default(),
        importing_slots: Default::default(),
    });
}

fn apply_fail_report(state: &ClusterState, node_id: &str) {
    if node_id == state.my_id {
        return;
    }
    if let Some(mut entry) = state.registry.lookup_mut(node_id) {
        if !entry.info.flags().contains(NodeFlags::FAIL) {
            let new_flags = entry.info.flags() | NodeFlags::FAIL;
            entry.info.set_flags(new_flags);
            entry.fail_time = Some(Instant::now());
            drop(entry);
            state.deferred.request_persist();
            state.deferred.request_health_recompute();
        }
    }
}

/// A PONG from our manual-failover target reporting it has caught up feeds
/// `manual_failover::on_replica_progress`.
fn apply_manual_failover_progress(state: &ClusterState, frame: &ClusterFrame) {
    let mut guard = state.manual_failover.lock().unwrap();
    if let Some(mf) = guard.as_mut() {
        crate::manual_failover::on_replica_progress(mf, &frame.sender_id, frame.sender_repl_offset);
    }
}

fn handle_auth_request_frame(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, frame: &ClusterFrame) {
    let force_ack = frame.frame_flags.contains(FrameFlags::FORCEACK);
    let node_timeout = state.config.node_timeout();
    let granted = election::handle_auth_request(
        state,
        &frame.sender_id,
        frame.sender_current_epoch,
        &frame.sender_slots,
        force_ack,
        node_timeout,
    );
    match granted {
        Ok(()) => election::send_auth_ack(state, links, my_addr, &frame.sender_id, force_ack),
        Err(reason) => debug!(candidate = %frame.sender_id, %reason, "auth request denied"),
    }
}

fn handle_auth_ack_frame(state: &ClusterState, frame: &ClusterFrame) {
    let master_id = {
        let Some(me) = state.registry.lookup(&state.my_id) else { return };
        if me.info.role != NodeRole::Replica {
            return;
        }
        me.info.replica_of.clone()
    };
    let Some(master_id) = master_id else { return };

    let quorum_reached = {
        let runtime = state.election.lock().unwrap();
        match &runtime.in_flight {
            Some(candidate) if candidate.epoch <= frame.sender_current_epoch => election::handle_auth_ack(state, candidate),
            _ => false,
        }
    };

    if quorum_reached {
        {
            let mut runtime = state.election.lock().unwrap();
            *runtime = crate::state::ElectionRuntime::default();
        }
        election::promote_to_master(state, &master_id);
        warn!(old_master = %master_id, "election quorum reached, promoting to master");
    }
}

/// A master in `Electing` phase nudged us with MFSTART: start a forced
/// election immediately rather than waiting for the master to actually fail.
fn handle_mfstart_frame(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, frame: &ClusterFrame) {
    let Some(me) = state.registry.lookup(&state.my_id) else { return };
    if me.info.role != NodeRole::Replica || me.info.replica_of.as_deref() != Some(frame.sender_id.as_str()) {
        return;
    }
    drop(me);

    {
        let runtime = state.election.lock().unwrap();
        if runtime.in_flight.is_some() {
            return;
        }
    }

    let epoch = election::start_election(state);
    {
        let mut runtime = state.election.lock().unwrap();
        runtime.in_flight =
            Some(election::CandidateElection { epoch, votes: AtomicU64::new(0), started_at: Instant::now() });
        runtime.next_attempt_at = None;
    }
    election::broadcast_auth_request(state, links, my_addr, true);
}

/// Applies a config-epoch-stamped slot takeover announcement: if `node_id`'s
/// announced epoch beats what we have on file for it, adopt the new slot
/// ownership (mirrors the teacher's `UPDATE` handling in its failover path).
fn apply_update(state: &ClusterState, node_id: &str, config_epoch: u64, slots: &BTreeSet<u16>) {
    if node_id == state.my_id {
        return;
    }
    let current_epoch = state.registry.lookup(node_id).map(|n| n.info.config_epoch).unwrap_or(0);
    if config_epoch <= current_epoch {
        return;
    }
    let previous_owners: Vec<(u16, String)> = slots
        .iter()
        .filter_map(|&slot| state.slots.owner(slot).map(|owner| (slot, owner)))
        .filter(|(_, owner)| owner != node_id)
        .collect();
    for (slot, owner) in &previous_owners {
        if let Some(mut prev) = state.registry.lookup_mut(owner) {
            prev.info.slots.remove(slot);
        }
    }
    for &slot in slots {
        state.slots.assign(slot, node_id);
    }
    if let Some(mut target) = state.registry.lookup_mut(node_id) {
        target.info.slots = slots.clone();
        target.info.config_epoch = config_epoch;
    }
    state.bump_epoch_to_at_least(config_epoch);
    state.deferred.request_persist();
    state.deferred.request_health_recompute();
}
