//! Deferred grants.
//!
//! Requesters whose grant was withheld while this node held or had
//! priority for the critical section. Each requester appears at most
//! once; inserting an already-deferred requester is a no-op. The set
//! keeps the timestamp of the deferred request so the node can record
//! exactly which request the later release grants.

use super::clock::LogicalTimestamp;
use super::ordering::{NodeId, Request};
use std::collections::BTreeMap;

/// Set of requesters owed a grant once this node releases.
#[derive(Debug, Clone, Default)]
pub struct DeferredSet {
    entries: BTreeMap<NodeId, LogicalTimestamp>,
}

impl DeferredSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer `request`. Returns false if its requester was already deferred.
    pub fn insert(&mut self, request: &Request) -> bool {
        match self.entries.get_mut(request.requester()) {
            Some(existing) => {
                // A retried copy of the same request; keep the newest stamp.
                if request.timestamp() > *existing {
                    *existing = request.timestamp();
                }
                false
            }
            None => {
                self.entries
                    .insert(request.requester().clone(), request.timestamp());
                true
            }
        }
    }

    /// Check whether `requester` is owed a grant.
    pub fn contains(&self, requester: &NodeId) -> bool {
        self.entries.contains_key(requester)
    }

    /// Number of deferred requesters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nobody is owed a grant.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deferred requester identities in order.
    pub fn requesters(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    /// Remove and return every deferred request, leaving the set empty.
    pub fn take_all(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(requester, timestamp)| Request::new(requester, timestamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str, ts: u64) -> Request {
        Request::new(NodeId::new(id), LogicalTimestamp::new(ts))
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut deferred = DeferredSet::new();
        assert!(deferred.insert(&req("node2", 4)));
        assert!(!deferred.insert(&req("node2", 4)));
        assert_eq!(deferred.len(), 1);
        assert!(deferred.contains(&NodeId::new("node2")));
    }

    #[test]
    fn test_duplicate_keeps_newest_timestamp() {
        let mut deferred = DeferredSet::new();
        deferred.insert(&req("node2", 4));
        deferred.insert(&req("node2", 6));
        deferred.insert(&req("node2", 5));

        let taken = deferred.take_all();
        assert_eq!(taken, vec![req("node2", 6)]);
    }

    #[test]
    fn test_take_all_empties_the_set() {
        let mut deferred = DeferredSet::new();
        deferred.insert(&req("node3", 9));
        deferred.insert(&req("node2", 7));

        let taken = deferred.take_all();
        assert_eq!(taken, vec![req("node2", 7), req("node3", 9)]);
        assert!(deferred.is_empty());
        assert_eq!(deferred.requesters().count(), 0);
    }
}
