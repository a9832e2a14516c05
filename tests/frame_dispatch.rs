// tests/frame_dispatch.rs
//
// Round-trips real cluster-bus frames through the wire codec and the link
// manager's read loop, then the inbound dispatcher, exercising the path a
// production process actually drives: socket bytes -> `ClusterBusCodec` ->
// `run_link`'s `inbound` channel -> `dispatch::handle_inbound_frame`.

use cluster_core::config::ClusterConfig;
use cluster_core::dispatch::handle_inbound_frame;
use cluster_core::link::{run_link, Link, LinkTable};
use cluster_core::node::{ClusterNode, NodeAddr, NodeFlags, NodeRole};
use cluster_core::state::ClusterState;
use cluster_core::wire::{ClusterFrame, FrameFlags, FramePayload, GossipDigest, MessageType};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

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

fn my_addr(port: u16) -> NodeAddr {
    NodeAddr { ip: "127.0.0.1".into(), client_port: port, bus_port: port + 10_000, plaintext_port: None }
}

fn meet_frame(sender_id: &str, sender_addr: NodeAddr) -> ClusterFrame {
    ClusterFrame {
        msg_type: MessageType::Meet,
        sender_id: sender_id.to_string(),
        sender_current_epoch: 0,
        sender_config_epoch: 0,
        sender_repl_offset: 0,
        sender_slots: BTreeSet::new(),
        sender_master_id: None,
        sender_addr,
        sender_flags: NodeFlags::PRIMARY,
        sender_cluster_ok: true,
        frame_flags: FrameFlags::empty(),
        payload: FramePayload::Gossip(vec![]),
    }
}

/// A MEET frame sent down a real duplex socket reaches the far side's
/// inbound channel via `run_link`, and dispatching it there both registers
/// the sender and queues a PONG back over the link's outbound sender.
#[tokio::test]
async fn meet_frame_round_trips_through_link_and_dispatcher() {
    let (client_sock, server_sock) = tokio::io::duplex(64 * 1024);

    let (client_inbound_tx, mut client_inbound_rx) = mpsc::unbounded_channel();
    let (client_outbound_tx, client_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(client_sock, client_outbound_rx, client_inbound_tx, "server".into()));

    let (server_inbound_tx, mut server_inbound_rx) = mpsc::unbounded_channel();
    let (server_outbound_tx, server_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(server_sock, server_outbound_rx, server_inbound_tx, "client".into()));

    let server_state =
        ClusterState::new(ClusterConfig { enabled: true, announce_port: 7001, ..Default::default() }, node("server", NodeRole::Primary));
    let server_links = LinkTable::new();
    server_links.insert("client".to_string(), Link { peer_id: Some("client".into()), outbound: server_outbound_tx });

    let frame = meet_frame("client", my_addr(7000));
    client_outbound_tx.send(frame).unwrap();

    let received = server_inbound_rx.recv().await.expect("server should receive the MEET frame over the wire");
    assert_eq!(received.msg_type, MessageType::Meet);
    assert_eq!(received.sender_id, "client");

    handle_inbound_frame(&server_state, &server_links, my_addr(7001), received);

    assert!(server_state.registry.contains("client"));

    // The dispatcher queued a PONG on the server's outbound sender, which
    // the server's `run_link` task should have written back down the
    // socket for the client's `run_link` task to decode.
    let pong = client_inbound_rx.recv().await.expect("client should receive a PONG reply");
    assert_eq!(pong.msg_type, MessageType::Pong);
    assert_eq!(pong.sender_id, "server");
}

/// An AUTH_REQUEST carried over the wire is dispatched into `election`'s vote
/// logic and produces a real AUTH_ACK frame on the wire back to the sender.
#[tokio::test]
async fn auth_request_over_the_wire_produces_an_auth_ack() {
    let (candidate_sock, master_sock) = tokio::io::duplex(64 * 1024);

    let (candidate_inbound_tx, mut candidate_inbound_rx) = mpsc::unbounded_channel();
    let (candidate_outbound_tx, candidate_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(candidate_sock, candidate_outbound_rx, candidate_inbound_tx, "master".into()));

    let (master_inbound_tx, mut master_inbound_rx) = mpsc::unbounded_channel();
    let (master_outbound_tx, master_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(master_sock, master_outbound_rx, master_inbound_tx, "candidate".into()));

    let master_state =
        ClusterState::new(ClusterConfig { enabled: true, announce_port: 7002, ..Default::default() }, node("master", NodeRole::Primary));
    master_state.slots.assign(1, "master");
    if let Some(mut me) = master_state.registry.lookup_mut("master") {
        me.info.slots.insert(1);
    }
    let mut failed_old_master = node("old-master", NodeRole::Primary);
    failed_old_master.flags = (NodeFlags::PRIMARY | NodeFlags::FAIL).bits();
    master_state.registry.add(failed_old_master);
    let mut candidate = node("candidate", NodeRole::Replica);
    candidate.replica_of = Some("old-master".into());
    master_state.registry.add(candidate);

    let master_links = LinkTable::new();
    master_links.insert("candidate".to_string(), Link { peer_id: Some("candidate".into()), outbound: master_outbound_tx });

    let mut frame = meet_frame("candidate", my_addr(7003));
    frame.msg_type = MessageType::AuthRequest;
    frame.payload = FramePayload::AuthOnly;
    frame.sender_current_epoch = 9;
    candidate_outbound_tx.send(frame).unwrap();

    let received = master_inbound_rx.recv().await.expect("master should receive the AUTH_REQUEST");
    handle_inbound_frame(&master_state, &master_links, my_addr(7002), received);

    let ack = candidate_inbound_rx.recv().await.expect("candidate should receive an AUTH_ACK back");
    assert_eq!(ack.msg_type, MessageType::AuthAck);
    assert_eq!(ack.sender_id, "master");
}

/// A digest naming a node we've never heard of, piggybacked on a PING,
/// reaches the registry once decoded off a real socket.
#[tokio::test]
async fn ping_with_gossip_digest_registers_new_node_over_the_wire() {
    let (a_sock, b_sock) = tokio::io::duplex(64 * 1024);

    let (a_inbound_tx, _a_inbound_rx) = mpsc::unbounded_channel();
    let (a_outbound_tx, a_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(a_sock, a_outbound_rx, a_inbound_tx, "b".into()));

    let (b_inbound_tx, mut b_inbound_rx) = mpsc::unbounded_channel();
    let (b_outbound_tx, b_outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(b_sock, b_outbound_rx, b_inbound_tx, "a".into()));

    let b_state = ClusterState::new(ClusterConfig { enabled: true, announce_port: 7004, ..Default::default() }, node("b", NodeRole::Primary));
    let b_links = LinkTable::new();
    b_links.insert("a".to_string(), Link { peer_id: Some("a".into()), outbound: b_outbound_tx });

    let digest = GossipDigest {
        id: "discovered".into(),
        last_ping_sent_secs: 0,
        last_pong_received_secs: 0,
        addr: my_addr(7005),
        flags: NodeFlags::PRIMARY,
    };
    let mut frame = meet_frame("a", my_addr(7006));
    frame.msg_type = MessageType::Ping;
    frame.payload = FramePayload::Gossip(vec![digest]);
    a_outbound_tx.send(frame).unwrap();

    let received = b_inbound_rx.recv().await.expect("b should receive the PING frame");
    handle_inbound_frame(&b_state, &b_links, my_addr(7004), received);

    assert!(b_state.registry.contains("discovered"));
}
