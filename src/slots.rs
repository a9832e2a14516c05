// src/slots.rs

//! The 16384-slot hash table: key routing, slot ownership, and the
//! migration/import side-channels used while resharding.

use bytes::Bytes;
use crc::{CRC_16_USB, Crc};
use parking_lot::RwLock;

/// The total number of hash slots in the cluster.
pub const NUM_SLOTS: usize = 16384;

/// The CRC16 variant used to compute hash slots; this exact polynomial is
/// part of the wire-compatibility contract with Redis Cluster clients.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// Computes the hash slot for a key.
///
/// If the key contains a non-empty `{...}` hash tag, only the tag's content is
/// hashed, guaranteeing colocation of tagged keys. On an empty tag (`{}`) or a
/// missing closing brace, the full key is hashed instead.
pub fn key_slot(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        let end = start + 1 + end_offset;
        if end > start + 1 {
            return CRC16_ALGO.checksum(&key[start + 1..end]) & 0x3FFF;
        }
    }
    CRC16_ALGO.checksum(key) & 0x3FFF
}

/// Convenience wrapper over [`key_slot`] for callers already holding a
/// [`Bytes`] key.
pub fn key_slot_bytes(key: &Bytes) -> u16 {
    key_slot(key)
}

/// The 16384-entry slot ownership table, plus the local node's migration and
/// import side-channels.
///
/// Ownership is stored as a parallel table to each node's own `slots` bitset
/// (data model note: gossip serializes the bitmap, routing queries this
/// table — both are kept in sync by `ClusterState`, never by this type alone).
pub struct SlotMap {
    owner: Vec<RwLock<Option<String>>>,
    /// Set only for slots this node is migrating away; value is the
    /// destination node id (invariant: only set for slots this node owns).
    migrating_to: Vec<RwLock<Option<String>>>,
    /// Set only for slots this node is importing; value is the source node id
    /// (invariant: only set for slots this node does not own).
    importing_from: Vec<RwLock<Option<String>>>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            owner: (0..NUM_SLOTS).map(|_| RwLock::new(None)).collect(),
            migrating_to: (0..NUM_SLOTS).map(|_| RwLock::new(None)).collect(),
            importing_from: (0..NUM_SLOTS).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<String> {
        self.owner[slot as usize].read().clone()
    }

    pub fn assign(&self, slot: u16, node_id: &str) {
        *self.owner[slot as usize].write() = Some(node_id.to_string());
    }

    pub fn unassign(&self, slot: u16) {
        *self.owner[slot as usize].write() = None;
    }

    pub fn is_owned_by(&self, slot: u16, node_id: &str) -> bool {
        self.owner[slot as usize]
            .read()
            .as_deref()
            .is_some_and(|id| id == node_id)
    }

    pub fn migrating_to(&self, slot: u16) -> Option<String> {
        self.migrating_to[slot as usize].read().clone()
    }

    pub fn set_migrating_to(&self, slot: u16, dest: Option<String>) {
        *self.migrating_to[slot as usize].write() = dest;
    }

    pub fn importing_from(&self, slot: u16) -> Option<String> {
        self.importing_from[slot as usize].read().clone()
    }

    pub fn set_importing_from(&self, slot: u16, source: Option<String>) {
        *self.importing_from[slot as usize].write() = source;
    }

    /// Counts slots currently owned by `node_id`, used for the zero-slots
    /// checks in failure detection and replica migration.
    pub fn count_owned_by(&self, node_id: &str) -> usize {
        self.owner
            .iter()
            .filter(|slot| slot.read().as_deref() == Some(node_id))
            .count()
    }

    /// Produces the compact `(start, end)` contiguous ranges owned by
    /// `node_id`, in the order `CLUSTER SLOTS`/`nodes.conf` expect.
    pub fn owned_ranges(&self, node_id: &str) -> Vec<(u16, u16)> {
        let mut ranges = Vec::new();
        let mut start: Option<u16> = None;
        for slot in 0..NUM_SLOTS as u16 {
            let owned = self.is_owned_by(slot, node_id);
            match (owned, start) {
                (true, None) => start = Some(slot),
                (false, Some(s)) => {
                    ranges.push((s, slot - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push((s, NUM_SLOTS as u16 - 1));
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_pure() {
        let key = b"foo".as_slice();
        assert_eq!(key_slot(key), key_slot(key));
    }

    #[test]
    fn hash_tag_colocation() {
        let a = key_slot(b"{user:42}name");
        let b = key_slot(b"{user:42}email");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_hash_tag_hashes_full_key() {
        let tagged = key_slot(b"{}foo");
        let untagged = key_slot(b"foo_different");
        // An empty tag must not be treated as a hash tag; `{}foo` hashes as
        // a whole literal key, not as `foo`.
        assert_eq!(tagged, key_slot(b"{}foo"));
        assert_ne!(tagged, untagged);
    }

    #[test]
    fn missing_closing_brace_hashes_full_key() {
        let key = b"foo{bar";
        assert_eq!(key_slot(key), CRC16_ALGO.checksum(key) & 0x3FFF);
    }

    #[test]
    fn scenario_a_moved_slot_for_tagged_key() {
        // `GET {x}foo` hash-tags on "x"; CRC16("x") & 0x3FFF must be 4261,
        // matching the worked example in the redirection scenario.
        assert_eq!(key_slot(b"{x}foo"), 4261);
    }

    #[test]
    fn slot_always_in_range() {
        for sample in ["", "a", "{}", "hello world", "user:{1000}:profile"] {
            assert!((key_slot(sample.as_bytes()) as usize) < NUM_SLOTS);
        }
    }

    #[test]
    fn owned_ranges_are_contiguous() {
        let map = SlotMap::new();
        for slot in 0..100 {
            map.assign(slot, "node-a");
        }
        for slot in 200..210 {
            map.assign(slot, "node-a");
        }
        assert_eq!(map.owned_ranges("node-a"), vec![(0, 99), (200, 209)]);
    }
}
