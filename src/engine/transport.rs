//! Peer transport capability.
//!
//! The engine never talks to the network directly. Each peer is reached
//! through a [`PeerTransport`] injected at construction: the gRPC client in
//! production, in-memory loopbacks in tests.

use super::clock::LogicalTimestamp;
use super::ordering::{NodeId, Request};
use crate::core::error::MutexResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Answer to a `RequestAccess` or `ReleaseAccess` message.
///
/// For a request, `granted == false` means "deferred, a release follows".
/// For a release, the flag reports whether the receiver was waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerReply {
    pub granted: bool,
    pub timestamp: LogicalTimestamp,
}

impl PeerReply {
    /// An immediate grant.
    pub fn grant(timestamp: LogicalTimestamp) -> Self {
        Self {
            granted: true,
            timestamp,
        }
    }

    /// A deferral.
    pub fn defer(timestamp: LogicalTimestamp) -> Self {
        Self {
            granted: false,
            timestamp,
        }
    }
}

/// Outbound capability for one peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask the peer for permission to enter the critical section.
    async fn request_access(&self, request: Request) -> MutexResult<PeerReply>;

    /// Deliver a deferred grant to the peer.
    async fn release_access(&self, release: Request) -> MutexResult<PeerReply>;
}

/// The fixed set of peers, keyed by identity.
#[derive(Clone, Default)]
pub struct PeerSet {
    peers: BTreeMap<NodeId, Arc<dyn PeerTransport>>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, replacing any previous transport for the same identity.
    pub fn insert(&mut self, id: NodeId, transport: Arc<dyn PeerTransport>) {
        self.peers.insert(id, transport);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_peer(mut self, id: NodeId, transport: Arc<dyn PeerTransport>) -> Self {
        self.insert(id, transport);
        self
    }

    /// Transport for `id`, if it is a member.
    pub fn get(&self, id: &NodeId) -> Option<&Arc<dyn PeerTransport>> {
        self.peers.get(id)
    }

    /// Check membership.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Peer identities in order.
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    /// Number of peers; an acquisition needs exactly this many grants.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True for a single-node system.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl std::fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.peers.keys()).finish()
    }
}
