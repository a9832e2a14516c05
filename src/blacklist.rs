// src/blacklist.rs

//! Tracks nodes removed via `CLUSTER FORGET` so gossip cannot silently
//! re-admit them before the operator's intent has had a chance to propagate.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// TTL for a blacklist entry; matches real Redis Cluster's forget window.
pub const BLACKLIST_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct Blacklist {
    entries: DashMap<String, Instant>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node_id: &str) {
        self.entries
            .insert(node_id.to_string(), Instant::now() + BLACKLIST_TTL);
    }

    /// Returns `true` if `node_id` is currently blacklisted, evicting the
    /// entry first if it has expired.
    pub fn contains(&self, node_id: &str) -> bool {
        match self.entries.get(node_id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                drop(self.entries.get(node_id));
                self.entries.remove(node_id);
                false
            }
            None => false,
        }
    }

    /// Drops all expired entries; called from the cron tick so the map does
    /// not grow unbounded in a long-running, high-churn cluster.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }
}
