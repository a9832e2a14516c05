// src/registry.rs

//! The node registry: the authoritative in-memory map of node identity to
//! state that every other component consults by identifier.

use crate::node::{ClusterNode, NodeFlags, NodeRuntimeState};
use crate::slots::SlotMap;
use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};

/// Arena of known nodes keyed by their stable opaque identifier. Relations
/// (replica -> master, master -> replicas) are stored as identifiers and
/// resolved on access, which is what makes `remove` a single operation
/// instead of a graph walk.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeRuntimeState>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str) -> Option<Ref<'_, String, NodeRuntimeState>> {
        self.nodes.get(id)
    }

    pub fn lookup_mut(&self, id: &str) -> Option<RefMut<'_, String, NodeRuntimeState>> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn add(&self, node: ClusterNode) {
        self.nodes
            .insert(node.id.clone(), NodeRuntimeState::new(node));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes a node from the registry. Also un-assigns every slot it owned
    /// in `slots`, and strips any failure reports *by* this node from every
    /// other node's report list, per the registry contract.
    pub fn remove(&self, id: &str, slots: &SlotMap) -> Option<NodeRuntimeState> {
        let removed = self.nodes.remove(id).map(|(_, state)| state);
        if let Some(state) = &removed {
            for slot in &state.info.slots {
                slots.unassign(*slot);
            }
        }
        for mut entry in self.nodes.iter_mut() {
            entry
                .value_mut()
                .pfail_reports
                .retain(|(reporter, _)| reporter != id);
        }
        removed
    }

    /// Replaces a handshake node's provisional identifier with the real one
    /// reported in its first PONG. If the real identifier already exists in
    /// the registry (a collision), the handshake entry is dropped instead of
    /// overwriting the existing node (data model invariant v).
    pub fn rename(&self, old_id: &str, new_id: &str) -> bool {
        if self.nodes.contains_key(new_id) {
            self.nodes.remove(old_id);
            return false;
        }
        if let Some((_, mut state)) = self.nodes.remove(old_id) {
            state.info.id = new_id.to_string();
            self.nodes.insert(new_id.to_string(), state);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> dashmap::iter::Iter<'_, String, NodeRuntimeState> {
        self.nodes.iter()
    }

    /// Iterates over nodes whose flags intersect `filter`; an empty filter
    /// matches every node.
    pub fn iter_with_flags(&self, filter: NodeFlags) -> Vec<ClusterNode> {
        self.nodes
            .iter()
            .filter(|e| filter.is_empty() || e.value().info.flags().intersects(filter))
            .map(|e| e.value().info.clone())
            .collect()
    }

    /// Replicas whose `replica_of` points at `master_id` (data model
    /// invariant iii, resolved on access rather than stored redundantly).
    pub fn replicas_of(&self, master_id: &str) -> Vec<ClusterNode> {
        self.nodes
            .iter()
            .filter(|e| e.value().info.replica_of.as_deref() == Some(master_id))
            .map(|e| e.value().info.clone())
            .collect()
    }

    pub fn count_online_masters(&self) -> usize {
        self.nodes
            .iter()
            .filter(|e| {
                let flags = e.value().info.flags();
                flags.contains(NodeFlags::PRIMARY) && !flags.intersects(NodeFlags::FAIL)
            })
            .count()
    }
}
