//! Lease table for ephemeral keys
//!
//! Maps each lease to the keys bound to it and keeps a deadline index so the
//! reaper can find expired leases without scanning every lease:
//! - `deadlines`: BTreeMap<deadline, Set<LeaseId>> in sorted order
//! - `find_expired()` is O(expired count), not O(total leases)

use crate::kv::LeaseId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

/// Leases, their deadlines, and bound keys
#[derive(Debug, Default)]
pub struct LeaseTable {
    next_id: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    deadlines: BTreeMap<Instant, HashSet<LeaseId>>,
}

impl LeaseTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lease expiring `ttl` after `now`
    pub fn grant(&mut self, ttl: Duration, now: Instant) -> LeaseId {
        self.next_id += 1;
        let id = self.next_id;
        let deadline = now + ttl;
        self.leases.insert(
            id,
            Lease {
                ttl,
                deadline,
                keys: HashSet::new(),
            },
        );
        self.deadlines.entry(deadline).or_default().insert(id);
        id
    }

    fn unindex(&mut self, deadline: Instant, id: LeaseId) {
        if let Some(ids) = self.deadlines.get_mut(&deadline) {
            ids.remove(&id);
            if ids.is_empty() {
                self.deadlines.remove(&deadline);
            }
        }
    }

    /// Push the deadline out by the lease's ttl. Returns false for unknown leases.
    pub fn renew(&mut self, id: LeaseId, now: Instant) -> bool {
        let Some(lease) = self.leases.get_mut(&id) else {
            return false;
        };
        let old = lease.deadline;
        lease.deadline = now + lease.ttl;
        let new = lease.deadline;
        self.unindex(old, id);
        self.deadlines.entry(new).or_default().insert(id);
        true
    }

    /// Whether the lease exists
    pub fn contains(&self, id: LeaseId) -> bool {
        self.leases.contains_key(&id)
    }

    /// Bind a key to a lease. Returns false for unknown leases.
    pub fn attach(&mut self, id: LeaseId, key: &str) -> bool {
        match self.leases.get_mut(&id) {
            Some(lease) => {
                lease.keys.insert(key.to_string());
                true
            }
            None => false,
        }
    }

    /// Unbind a key from a lease
    pub fn detach(&mut self, id: LeaseId, key: &str) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Remove a lease, returning its bound keys
    pub fn remove(&mut self, id: LeaseId) -> Vec<String> {
        match self.leases.remove(&id) {
            Some(lease) => {
                self.unindex(lease.deadline, id);
                lease.keys.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Leases whose deadline is at or before `now`
    pub fn find_expired(&self, now: Instant) -> Vec<LeaseId> {
        self.deadlines
            .range(..=now)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Number of live leases
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Whether there are no leases
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
