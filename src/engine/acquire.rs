//! Outbound acquisition.
//!
//! `acquire` stamps a request, fans it out to every peer concurrently and
//! fans the answers back in through a per-peer counting join. A peer's
//! permission is either an immediate `granted = true` reply or, after a
//! deferral, its later release message; exactly one of the two is counted.
//! The node lock is never held while waiting on a peer.

use super::clock::LogicalTimestamp;
use super::node::{Node, NodeState};
use super::ordering::{NodeId, Request};
use super::transport::PeerReply;
use crate::core::error::{MutexError, MutexResult};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::oneshot;

/// Proof that this node holds the critical section.
///
/// Only [`Node::acquire`] creates one, and [`Node::release`] consumes it.
#[must_use = "a held critical section must be released"]
#[derive(Debug)]
pub struct HeldSection {
    request: Request,
}

impl HeldSection {
    /// The request that won the critical section.
    pub fn request(&self) -> &Request {
        &self.request
    }
}

/// How a peer's permission reached this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSource {
    /// `RequestAccess` answered `granted = true`.
    Reply,
    /// The peer deferred and later sent `ReleaseAccess`.
    Release,
}

/// Counting join over the grants of one acquisition.
#[derive(Debug)]
pub struct GrantTally {
    expected: usize,
    received: BTreeMap<NodeId, GrantSource>,
}

impl GrantTally {
    /// Expect one grant from each of `expected` peers.
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            received: BTreeMap::new(),
        }
    }

    /// Record the grant of `peer`. A second grant from the same peer is an
    /// invariant violation.
    pub fn record(&mut self, peer: NodeId, source: GrantSource) -> MutexResult<()> {
        if let Some(previous) = self.received.insert(peer.clone(), source) {
            return Err(MutexError::invariant(format!(
                "grant from {} counted twice ({:?} then {:?})",
                peer, previous, source
            )));
        }
        Ok(())
    }

    /// Grants received so far.
    pub fn count(&self) -> usize {
        self.received.len()
    }

    /// True once every peer has granted.
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.expected
    }

    /// How the grant of `peer` arrived, if it has.
    pub fn source(&self, peer: &NodeId) -> Option<GrantSource> {
        self.received.get(peer).copied()
    }
}

type GrantSlot = oneshot::Receiver<LogicalTimestamp>;

impl Node {
    /// Acquire the critical section.
    ///
    /// Returns `Ok(None)` without doing anything if an acquisition is already
    /// outstanding or the section is already held. Otherwise completes only
    /// once every peer has granted. An unreachable peer stalls the call.
    ///
    /// The returned future must be driven to completion: dropping it leaves
    /// the node `Wanted` with requests outstanding on its peers.
    pub async fn acquire(&self) -> MutexResult<Option<HeldSection>> {
        let Some((request, slots)) = self.begin_acquisition()? else {
            return Ok(None);
        };

        tracing::info!(
            node = %self.id,
            request = %request,
            peers = self.peers.len(),
            "requesting critical section"
        );

        let collectors = slots
            .into_iter()
            .map(|(peer, slot)| self.collect_grant(peer, request.clone(), slot));
        let grants = try_join_all(collectors).await?;

        let mut tally = GrantTally::new(self.peers.len());
        for (peer, source) in grants {
            tally.record(peer, source)?;
        }

        self.enter_held(request, &tally).map(Some)
    }

    /// Acquire, run `body` inside the critical section, then release.
    ///
    /// Returns `Ok(None)` if an acquisition was already outstanding.
    pub async fn run_exclusive<F, Fut, T>(&self, body: F) -> MutexResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(section) = self.acquire().await? else {
            return Ok(None);
        };
        let value = body().await;
        self.release(section).await?;
        Ok(Some(value))
    }

    /// `Released → Wanted`: stamp the request and open one grant slot per peer.
    fn begin_acquisition(&self) -> MutexResult<Option<(Request, Vec<(NodeId, GrantSlot)>)>> {
        let mut core = self.core.lock();

        if core.state != NodeState::Released {
            tracing::debug!(
                node = %self.id,
                state = %core.state,
                "acquisition already outstanding, ignoring"
            );
            return Ok(None);
        }
        core.check_request_invariant(&self.id)?;
        if !core.grant_slots.is_empty() {
            return Err(MutexError::invariant(format!(
                "{} grant slots left open by a previous acquisition",
                core.grant_slots.len()
            )));
        }

        let timestamp = core.clock.tick();
        let request = Request::new(self.id.clone(), timestamp);
        core.state = NodeState::Wanted;
        core.current = Some(request.clone());

        let mut slots = Vec::with_capacity(self.peers.len());
        for peer in self.peers.ids() {
            let (tx, rx) = oneshot::channel();
            core.grant_slots.insert(peer.clone(), tx);
            slots.push((peer.clone(), rx));
        }

        Ok(Some((request, slots)))
    }

    /// Wait for the permission of a single peer.
    async fn collect_grant(
        &self,
        peer: NodeId,
        request: Request,
        mut slot: GrantSlot,
    ) -> MutexResult<(NodeId, GrantSource)> {
        let transport = self.peers.get(&peer).cloned().ok_or_else(|| {
            MutexError::invariant(format!("grant slot opened for non-member {}", peer))
        })?;

        tracing::debug!(node = %self.id, peer = %peer, request = %request, "sending request");

        // A release can overtake the reply to our request; whichever
        // signal is first settles this peer. If the release wins, the
        // dropped reply's timestamp is never merged. The release stamp is
        // later than that reply and was merged by `on_release`.
        let outcome = tokio::select! {
            released = &mut slot => return self.released_grant(peer, released),
            reply = transport.request_access(request) => reply,
        };

        match outcome {
            Ok(reply) => {
                self.observe_reply(&peer, reply);
                if reply.granted {
                    tracing::debug!(node = %self.id, peer = %peer, "granted immediately");
                    return Ok((peer, GrantSource::Reply));
                }
                tracing::debug!(node = %self.id, peer = %peer, "deferred, waiting for release");
            }
            Err(err) => {
                tracing::warn!(
                    node = %self.id,
                    peer = %peer,
                    error = %err,
                    "request failed; acquisition stalls on this peer (liveness risk)"
                );
            }
        }

        let released = slot.await;
        self.released_grant(peer, released)
    }

    fn observe_reply(&self, peer: &NodeId, reply: PeerReply) {
        let mut core = self.core.lock();
        core.clock.merge(reply.timestamp);
        if reply.granted {
            core.grant_slots.remove(peer);
        }
    }

    fn released_grant(
        &self,
        peer: NodeId,
        released: Result<LogicalTimestamp, oneshot::error::RecvError>,
    ) -> MutexResult<(NodeId, GrantSource)> {
        match released {
            Ok(_) => Ok((peer, GrantSource::Release)),
            Err(_) => Err(MutexError::invariant(format!(
                "grant slot for {} closed before any grant arrived",
                peer
            ))),
        }
    }

    /// `Wanted → Held`, only with a grant from every peer.
    fn enter_held(&self, request: Request, tally: &GrantTally) -> MutexResult<HeldSection> {
        let mut core = self.core.lock();

        if !tally.is_complete() {
            return Err(MutexError::invariant(format!(
                "entering critical section with {} of {} grants",
                tally.count(),
                self.peers.len()
            )));
        }
        if core.state != NodeState::Wanted || core.current.as_ref() != Some(&request) {
            return Err(MutexError::invariant(format!(
                "acquisition of {} completed while node is {}",
                request, core.state
            )));
        }
        if !core.grant_slots.is_empty() {
            return Err(MutexError::invariant(format!(
                "all grants counted but {} slots still open",
                core.grant_slots.len()
            )));
        }

        core.state = NodeState::Held;
        core.stats.acquisitions += 1;
        tracing::info!(
            node = %self.id,
            request = %request,
            timestamp = core.clock.current().get(),
            "entering critical section"
        );

        Ok(HeldSection { request })
    }
}
