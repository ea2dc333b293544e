//! Node state machine and inbound handlers.
//!
//! A node moves `Released → Wanted → Held → Released`. Clock, state,
//! outstanding request, deferred set and per-peer grant slots live in one
//! [`NodeCore`] behind one lock. Every decision reads a single consistent
//! snapshot of that core; no network I/O happens while the lock is held.
//!
//! # Grant delivery
//!
//! A peer that grants immediately answers `RequestAccess` with
//! `granted = true`. A peer that defers answers `granted = false` and later
//! calls `ReleaseAccess` exactly once. For every outstanding acquisition
//! the core keeps one grant slot per peer; the release handler fills the
//! slot, and the acquisition counts whichever signal arrives first, once.

use super::clock::{LamportClock, LogicalTimestamp};
use super::deferred::DeferredSet;
use super::ordering::{NodeId, Request};
use super::transport::{PeerReply, PeerSet};
use crate::core::error::{MutexError, MutexResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Protocol state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Not interested in the critical section.
    Released,
    /// An acquisition is outstanding.
    Wanted,
    /// This node occupies the critical section.
    Held,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Released => write!(f, "RELEASED"),
            Self::Wanted => write!(f, "WANTED"),
            Self::Held => write!(f, "HELD"),
        }
    }
}

/// Protocol counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Acquisitions that reached `Held`.
    pub acquisitions: u64,
    /// Inbound requests answered with an immediate grant.
    pub grants_given: u64,
    /// Inbound requests deferred.
    pub deferrals: u64,
    /// Release messages sent to deferred peers.
    pub releases_sent: u64,
    /// Release messages received.
    pub releases_received: u64,
}

/// Point-in-time view of a node for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub clock: LogicalTimestamp,
    pub state: NodeState,
    pub current_request: Option<Request>,
    pub deferred: Vec<NodeId>,
}

/// Mutable protocol state. Only ever touched under [`Node`]'s lock.
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub(crate) clock: LamportClock,
    pub(crate) state: NodeState,
    pub(crate) current: Option<Request>,
    pub(crate) deferred: DeferredSet,
    /// Grant slots of the outstanding acquisition, one per peer not yet heard from.
    pub(crate) grant_slots: HashMap<NodeId, oneshot::Sender<LogicalTimestamp>>,
    /// Highest request timestamp already granted, per peer. Retried copies
    /// of a granted request are answered without deferring again.
    pub(crate) granted_through: HashMap<NodeId, LogicalTimestamp>,
    pub(crate) stats: NodeStats,
}

impl NodeCore {
    fn new() -> Self {
        Self {
            clock: LamportClock::new(),
            state: NodeState::Released,
            current: None,
            deferred: DeferredSet::new(),
            grant_slots: HashMap::new(),
            granted_through: HashMap::new(),
            stats: NodeStats::default(),
        }
    }

    pub(crate) fn record_granted(&mut self, request: &Request) {
        let entry = self
            .granted_through
            .entry(request.requester().clone())
            .or_insert(request.timestamp());
        if request.timestamp() > *entry {
            *entry = request.timestamp();
        }
    }

    fn already_granted(&self, request: &Request) -> bool {
        self.granted_through
            .get(request.requester())
            .is_some_and(|ts| request.timestamp() <= *ts)
    }

    /// Checks that `current` is present exactly when the node is not released.
    pub(crate) fn check_request_invariant(&self, own_id: &NodeId) -> MutexResult<()> {
        match (&self.state, &self.current) {
            (NodeState::Released, None) => Ok(()),
            (NodeState::Released, Some(req)) => Err(MutexError::invariant(format!(
                "released node still carries request {}",
                req
            ))),
            (state, None) => Err(MutexError::invariant(format!(
                "node in {} has no outstanding request",
                state
            ))),
            (_, Some(req)) if req.requester() != own_id => Err(MutexError::invariant(format!(
                "outstanding request {} is not owned by {}",
                req, own_id
            ))),
            _ => Ok(()),
        }
    }
}

/// One participant in the mutual-exclusion protocol.
///
/// There is one `Node` per process. It is shared (behind an `Arc`) between
/// the gRPC handlers, which call [`on_request`](Self::on_request) and
/// [`on_release`](Self::on_release) concurrently, and the local scheduling
/// loop, which drives [`acquire`](Self::acquire) and
/// [`release`](Self::release).
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) peers: PeerSet,
    pub(crate) core: Mutex<NodeCore>,
}

impl Node {
    /// Create a node in the `Released` state with its clock at zero.
    pub fn new(id: NodeId, peers: PeerSet) -> Self {
        Self {
            id,
            peers,
            core: Mutex::new(NodeCore::new()),
        }
    }

    /// This node's identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The fixed peer set.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Current protocol state.
    pub fn state(&self) -> NodeState {
        self.core.lock().state
    }

    /// Current clock value.
    pub fn clock(&self) -> LogicalTimestamp {
        self.core.lock().clock.current()
    }

    /// Protocol counters.
    pub fn stats(&self) -> NodeStats {
        self.core.lock().stats
    }

    /// Consistent view of the whole core.
    pub fn snapshot(&self) -> NodeSnapshot {
        let core = self.core.lock();
        NodeSnapshot {
            id: self.id.clone(),
            clock: core.clock.current(),
            state: core.state,
            current_request: core.current.clone(),
            deferred: core.deferred.requesters().cloned().collect(),
        }
    }

    /// Handle an inbound `RequestAccess`.
    ///
    /// The grant is withheld when this node is `Held`, or `Wanted` with a
    /// request that has priority over `request`. A withheld requester is
    /// added to the deferred set and will receive a release later.
    pub fn on_request(&self, request: Request) -> MutexResult<PeerReply> {
        self.validate_sender(request.requester())?;

        let mut core = self.core.lock();
        let timestamp = core.clock.merge(request.timestamp());

        if core.already_granted(&request) {
            tracing::debug!(
                node = %self.id,
                peer = %request.requester(),
                request = %request,
                "request already granted, answering again"
            );
            return Ok(PeerReply::grant(timestamp));
        }

        let defer = match core.state {
            NodeState::Held => true,
            NodeState::Wanted => match core.current.as_ref() {
                Some(own) => own.has_priority_over(&request),
                None => {
                    let err = MutexError::invariant("node is WANTED without a request");
                    tracing::error!(node = %self.id, error = %err, "defer decision aborted");
                    return Err(err);
                }
            },
            NodeState::Released => false,
        };

        if defer {
            core.deferred.insert(&request);
            core.stats.deferrals += 1;
            tracing::info!(
                node = %self.id,
                peer = %request.requester(),
                request = %request,
                state = %core.state,
                timestamp = timestamp.get(),
                "deferring request"
            );
            Ok(PeerReply::defer(timestamp))
        } else {
            core.record_granted(&request);
            core.stats.grants_given += 1;
            tracing::info!(
                node = %self.id,
                peer = %request.requester(),
                request = %request,
                state = %core.state,
                timestamp = timestamp.get(),
                "granting request"
            );
            Ok(PeerReply::grant(timestamp))
        }
    }

    /// Handle an inbound `ReleaseAccess`.
    ///
    /// Fills the grant slot for the sender if this node is waiting on it.
    /// A release nobody is waiting for is acknowledged with `granted = false`
    /// and changes nothing but the clock.
    ///
    /// A peer that deferred our request merged its timestamp first, so its
    /// release is stamped strictly later. A release stamped at or before
    /// the outstanding request answers an earlier acquisition (typically a
    /// retried send) and never counts as a grant.
    pub fn on_release(&self, release: Request) -> MutexResult<PeerReply> {
        self.validate_sender(release.requester())?;

        let mut core = self.core.lock();
        let timestamp = core.clock.merge(release.timestamp());
        core.stats.releases_received += 1;

        let stale = match core.current.as_ref() {
            Some(own) => release.timestamp() <= own.timestamp(),
            None => true,
        };
        if stale && core.grant_slots.contains_key(release.requester()) {
            tracing::warn!(
                node = %self.id,
                peer = %release.requester(),
                release = %release,
                "release predates the outstanding request, ignoring"
            );
            return Ok(PeerReply {
                granted: false,
                timestamp,
            });
        }

        let Some(slot) = core.grant_slots.remove(release.requester()) else {
            tracing::warn!(
                node = %self.id,
                peer = %release.requester(),
                state = %core.state,
                "release from peer with no pending grant, ignoring"
            );
            return Ok(PeerReply {
                granted: false,
                timestamp,
            });
        };

        tracing::info!(
            node = %self.id,
            peer = %release.requester(),
            timestamp = timestamp.get(),
            "received deferred grant"
        );
        // The acquisition may already have counted an immediate grant
        // from a retried request; a closed receiver is fine.
        let _ = slot.send(timestamp);
        Ok(PeerReply::grant(timestamp))
    }

    fn validate_sender(&self, sender: &NodeId) -> MutexResult<()> {
        if sender == &self.id {
            return Err(MutexError::protocol(format!(
                "self-addressed message from {}",
                sender
            )));
        }
        if !self.peers.contains(sender) {
            return Err(MutexError::UnknownPeer {
                peer: sender.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::PeerTransport;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl PeerTransport for Unreachable {
        async fn request_access(&self, _request: Request) -> MutexResult<PeerReply> {
            Err(MutexError::transport("test", "unreachable"))
        }

        async fn release_access(&self, _release: Request) -> MutexResult<PeerReply> {
            Err(MutexError::transport("test", "unreachable"))
        }
    }

    fn node(id: &str, peers: &[&str]) -> Node {
        let mut set = PeerSet::new();
        for peer in peers {
            set.insert(NodeId::new(*peer), Arc::new(Unreachable));
        }
        Node::new(NodeId::new(id), set)
    }

    fn req(id: &str, ts: u64) -> Request {
        Request::new(NodeId::new(id), LogicalTimestamp::new(ts))
    }

    fn force_wanted(node: &Node, ts: u64) {
        let mut core = node.core.lock();
        core.state = NodeState::Wanted;
        core.current = Some(req(node.id.as_str(), ts));
    }

    #[test]
    fn test_new_node_is_released() {
        let node = node("node1", &["node2"]);
        let snapshot = node.snapshot();
        assert_eq!(snapshot.state, NodeState::Released);
        assert_eq!(snapshot.clock, LogicalTimestamp::zero());
        assert!(snapshot.current_request.is_none());
        assert!(snapshot.deferred.is_empty());
    }

    #[test]
    fn test_released_node_grants_and_merges() {
        let node = node("node1", &["node2"]);
        let reply = node.on_request(req("node2", 10)).unwrap();
        assert!(reply.granted);
        assert_eq!(reply.timestamp, LogicalTimestamp::new(11));
        assert_eq!(node.clock(), LogicalTimestamp::new(11));
        assert_eq!(node.stats().grants_given, 1);
    }

    #[test]
    fn test_held_node_defers_everyone() {
        let node = node("node1", &["node2"]);
        force_wanted(&node, 1);
        node.core.lock().state = NodeState::Held;

        let reply = node.on_request(req("node2", 0)).unwrap();
        assert!(!reply.granted);
        assert_eq!(node.snapshot().deferred, vec![NodeId::new("node2")]);
    }

    #[test]
    fn test_self_addressed_request_is_rejected_without_mutation() {
        let node = node("node1", &["node2"]);
        let err = node.on_request(req("node1", 5)).unwrap_err();
        assert!(matches!(err, MutexError::ProtocolViolation { .. }));
        assert_eq!(node.clock(), LogicalTimestamp::zero());
    }

    #[test]
    fn test_unknown_peer_is_rejected() {
        let node = node("node1", &["node2"]);
        let err = node.on_request(req("node9", 5)).unwrap_err();
        assert!(matches!(err, MutexError::UnknownPeer { .. }));
        assert!(node.snapshot().deferred.is_empty());
    }

    #[test]
    fn test_wanted_without_request_is_invariant_violation() {
        let node = node("node1", &["node2"]);
        node.core.lock().state = NodeState::Wanted;
        let err = node.on_request(req("node2", 5)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stray_release_is_ignored() {
        let node = node("node1", &["node2"]);
        let reply = node.on_release(req("node2", 4)).unwrap();
        assert!(!reply.granted);
        assert_eq!(reply.timestamp, LogicalTimestamp::new(5));
        assert_eq!(node.state(), NodeState::Released);
        assert_eq!(node.stats().releases_received, 1);
    }

    #[test]
    fn test_release_older_than_own_request_keeps_slot_open() {
        let node = node("node1", &["node2"]);
        force_wanted(&node, 8);
        let (tx, mut rx) = oneshot::channel();
        node.core.lock().grant_slots.insert(NodeId::new("node2"), tx);

        let stale = node.on_release(req("node2", 8)).unwrap();
        assert!(!stale.granted);
        assert!(node.core.lock().grant_slots.contains_key(&NodeId::new("node2")));
        assert!(rx.try_recv().is_err());

        let fresh = node.on_release(req("node2", 12)).unwrap();
        assert!(fresh.granted);
        assert!(node.core.lock().grant_slots.is_empty());
        assert_eq!(rx.try_recv().unwrap(), LogicalTimestamp::new(13));
    }

    #[test]
    fn test_retried_request_after_grant_is_not_deferred() {
        let node = node("node1", &["node2"]);
        assert!(node.on_request(req("node2", 3)).unwrap().granted);

        // node1 now wants with a request that beats a fresh ts=3 request,
        // but the retried copy of the already granted one must still pass.
        force_wanted(&node, 2);
        assert!(node.on_request(req("node2", 3)).unwrap().granted);
        assert!(node.snapshot().deferred.is_empty());
    }

    #[test]
    fn test_request_invariant_check() {
        let node = node("node1", &[]);
        assert!(node.core.lock().check_request_invariant(&node.id).is_ok());

        node.core.lock().state = NodeState::Held;
        assert!(node.core.lock().check_request_invariant(&node.id).is_err());

        node.core.lock().current = Some(req("node2", 1));
        assert!(node.core.lock().check_request_invariant(&node.id).is_err());
    }
}
