// src/manual_failover.rs

//! The `CLUSTER FAILOVER` manual handshake: the master pauses writes and
//! pings its replicas with its current replication offset embedded, a
//! chosen replica starts a FORCEACK election once it has caught up, and the
//! whole thing resets if it doesn't complete within the timeout.

use crate::election;
use crate::link::LinkTable;
use crate::node::NodeAddr;
use crate::state::ClusterState;
use std::time::{Duration, Instant};

/// How long a manual failover handshake may run before it is abandoned and
/// the master resumes normal writes.
pub const MANUAL_FAILOVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualFailoverPhase {
    /// Writes are paused on the master; waiting for a replica to catch up to
    /// the paused offset.
    Paused,
    /// A replica has caught up and is running its FORCEACK election.
    Electing,
}

/// Master-side state for an in-progress manual failover.
pub struct ManualFailoverState {
    pub phase: ManualFailoverPhase,
    pub started_at: Instant,
    /// The replication offset writes were paused at; the handshake completes
    /// once a replica reports having applied up to this offset.
    pub paused_at_offset: u64,
    pub target_replica: Option<String>,
    /// Set once `drive` has sent the MFSTART nudge to `target_replica`, so it
    /// isn't resent every cron tick while `Electing` persists.
    pub mfstart_sent: bool,
}

/// Starts a manual failover on the master: pauses client writes (the caller
/// is responsible for actually gating the write path) and records the
/// offset replicas must catch up to.
pub fn start(state: &ClusterState) -> Result<ManualFailoverState, &'static str> {
    let me = state.registry.lookup(&state.my_id).ok_or("self missing")?;
    if !me.info.is_primary() {
        return Err("only a master can start a manual failover");
    }
    let offset = me.info.replication_offset;
    drop(me);
    if state.registry.replicas_of(&state.my_id).is_empty() {
        return Err("master has no replicas to fail over to");
    }
    Ok(ManualFailoverState {
        phase: ManualFailoverPhase::Paused,
        started_at: Instant::now(),
        paused_at_offset: offset,
        target_replica: None,
        mfstart_sent: false,
    })
}

/// Called when a replica reports (via its PAUSED-flagged PONG) that it has
/// applied up to `replica_offset`. Transitions to `Electing` once a replica
/// has caught up to the paused offset.
pub fn on_replica_progress(mf: &mut ManualFailoverState, replica_id: &str, replica_offset: u64) -> bool {
    if mf.phase != ManualFailoverPhase::Paused {
        return false;
    }
    if replica_offset >= mf.paused_at_offset {
        mf.phase = ManualFailoverPhase::Electing;
        mf.target_replica = Some(replica_id.to_string());
        true
    } else {
        false
    }
}

/// Returns `true` if the handshake has run past its timeout and should be
/// abandoned, resuming normal writes on the master.
pub fn has_timed_out(mf: &ManualFailoverState) -> bool {
    mf.started_at.elapsed() > MANUAL_FAILOVER_TIMEOUT
}

/// Drives the master side of an in-progress `CLUSTER FAILOVER` from
/// `cron::tick`: abandons a handshake that has run past its timeout, and once
/// a replica has caught up and entered `Electing`, nudges it with a single
/// MFSTART frame so it starts its own FORCEACK election. `Paused`-phase
/// progress itself arrives via `on_replica_progress`, called from the frame
/// dispatcher when a replica's PONG reports its offset.
pub fn drive(state: &ClusterState, links: &LinkTable, my_addr: NodeAddr) {
    let mut guard = state.manual_failover.lock().unwrap();
    let Some(mf) = guard.as_mut() else { return };

    if has_timed_out(mf) {
        *guard = None;
        return;
    }

    if mf.phase == ManualFailoverPhase::Electing && !mf.mfstart_sent {
        if let Some(target) = mf.target_replica.clone() {
            mf.mfstart_sent = true;
            let frame = election::build_mfstart_frame(state, my_addr);
            links.send(&target, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::{ClusterNode, NodeAddr, NodeFlags, NodeRole};

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

    fn fresh_state() -> ClusterState {
        let s = ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me", NodeRole::Primary));
        let mut r = node("replica", NodeRole::Replica);
        r.replica_of = Some("me".into());
        s.registry.add(r);
        s
    }

    #[test]
    fn refuses_to_start_without_replicas() {
        let s = ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("lonely", NodeRole::Primary));
        assert!(start(&s).is_err());
    }

    #[test]
    fn refuses_to_start_on_a_replica() {
        let s = ClusterState::new(ClusterConfig { announce_port: 6379, ..Default::default() }, node("me", NodeRole::Replica));
        assert!(start(&s).is_err());
    }

    #[test]
    fn progress_transitions_to_electing_once_caught_up() {
        let s = fresh_state();
        if let Some(mut me) = s.registry.lookup_mut("me") {
            me.info.replication_offset = 100;
        }
        let mut mf = start(&s).unwrap();
        assert!(!on_replica_progress(&mut mf, "replica", 50));
        assert_eq!(mf.phase, ManualFailoverPhase::Paused);
        assert!(on_replica_progress(&mut mf, "replica", 100));
        assert_eq!(mf.phase, ManualFailoverPhase::Electing);
        assert_eq!(mf.target_replica.as_deref(), Some("replica"));
    }

    #[test]
    fn times_out_after_the_deadline() {
        let mf = ManualFailoverState {
            phase: ManualFailoverPhase::Paused,
            started_at: Instant::now() - Duration::from_secs(10),
            paused_at_offset: 0,
            target_replica: None,
            mfstart_sent: false,
        };
        assert!(has_timed_out(&mf));
    }
}
