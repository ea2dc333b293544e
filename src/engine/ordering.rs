//! Node identities and the total order over requests.
//!
//! A request with the lower timestamp has priority. Equal timestamps are
//! broken by the lower requester identity under lexicographic order, so
//! two distinct requests are never tied.

use super::clock::LogicalTimestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Opaque node identity, unique within the peer set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A request for the critical section. Immutable once created.
///
/// The same shape is used for release messages: the requester is the
/// releasing node and the timestamp is its release tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    requester: NodeId,
    timestamp: LogicalTimestamp,
}

impl Request {
    /// Create a request.
    pub fn new(requester: NodeId, timestamp: LogicalTimestamp) -> Self {
        Self {
            requester,
            timestamp,
        }
    }

    /// The requesting node.
    pub fn requester(&self) -> &NodeId {
        &self.requester
    }

    /// The Lamport timestamp the request was stamped with.
    pub fn timestamp(&self) -> LogicalTimestamp {
        self.timestamp
    }

    /// True if `self` must enter the critical section before `other`.
    pub fn has_priority_over(&self, other: &Request) -> bool {
        self < other
    }
}

impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.requester.cmp(&other.requester))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.requester)
    }
}
