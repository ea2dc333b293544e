//! Release broadcast.
//!
//! Leaving the critical section ticks the clock once, returns the node to
//! `Released`, empties the deferred set, and then sends the release stamp
//! to every peer that was deferred. The sends happen after the lock is
//! dropped and in no particular order.

use super::acquire::HeldSection;
use super::clock::LogicalTimestamp;
use super::node::{Node, NodeState};
use super::ordering::{NodeId, Request};
use super::transport::PeerReply;
use crate::core::error::{MutexError, MutexResult};
use futures::future::join_all;

/// Outcome of a release broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Timestamp carried by every release message.
    pub timestamp: LogicalTimestamp,
    /// Deferred peers that accepted the release.
    pub notified: Vec<NodeId>,
    /// Deferred peers the release could not reach. Each of them stalls.
    pub failed: Vec<NodeId>,
}

impl Node {
    /// Leave the critical section and flush every deferred grant.
    pub async fn release(&self, section: HeldSection) -> MutexResult<ReleaseSummary> {
        let (release, owed) = self.leave_held(section)?;
        let timestamp = release.timestamp();

        let sends = owed
            .into_iter()
            .map(|deferred| self.send_release(deferred.requester().clone(), release.clone()));
        let results = join_all(sends).await;

        let mut summary = ReleaseSummary {
            timestamp,
            notified: Vec::new(),
            failed: Vec::new(),
        };
        for (peer, result) in results {
            match result {
                Ok(reply) => {
                    self.core.lock().clock.merge(reply.timestamp);
                    summary.notified.push(peer);
                }
                Err(err) => {
                    tracing::warn!(
                        node = %self.id,
                        peer = %peer,
                        error = %err,
                        "release not delivered; peer stalls (liveness risk)"
                    );
                    summary.failed.push(peer);
                }
            }
        }

        Ok(summary)
    }

    /// `Held → Released` under the lock; returns the release stamp and the
    /// requests that are now granted.
    fn leave_held(&self, section: HeldSection) -> MutexResult<(Request, Vec<Request>)> {
        let mut core = self.core.lock();

        if core.state != NodeState::Held || core.current.as_ref() != Some(section.request()) {
            return Err(MutexError::invariant(format!(
                "release of {} while node is {}",
                section.request(),
                core.state
            )));
        }

        let timestamp = core.clock.tick();
        core.state = NodeState::Released;
        core.current = None;

        let owed = core.deferred.take_all();
        for request in &owed {
            core.record_granted(request);
        }
        core.stats.releases_sent += owed.len() as u64;

        tracing::info!(
            node = %self.id,
            timestamp = timestamp.get(),
            deferred = owed.len(),
            "leaving critical section"
        );

        Ok((Request::new(self.id.clone(), timestamp), owed))
    }

    async fn send_release(
        &self,
        peer: NodeId,
        release: Request,
    ) -> (NodeId, MutexResult<PeerReply>) {
        let Some(transport) = self.peers.get(&peer).cloned() else {
            let err = MutexError::UnknownPeer {
                peer: peer.to_string(),
            };
            return (peer, Err(err));
        };

        tracing::debug!(node = %self.id, peer = %peer, release = %release, "sending release");
        let result = transport.release_access(release).await;
        (peer, result)
    }
}
