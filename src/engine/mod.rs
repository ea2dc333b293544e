//! Ricart-Agrawala mutual-exclusion engine.
//!
//! - [`clock`] - Lamport clock
//! - [`ordering`] - Node identities and request priority
//! - [`deferred`] - Requesters owed a grant
//! - [`transport`] - Peer transport capability
//! - [`node`] - State machine and inbound handlers
//! - [`acquire`] - Fan-out/fan-in acquisition
//! - [`release`] - Release broadcast

pub mod acquire;
pub mod clock;
pub mod deferred;
pub mod node;
pub mod ordering;
pub mod release;
pub mod transport;

pub use acquire::{GrantSource, GrantTally, HeldSection};
pub use clock::{LamportClock, LogicalTimestamp};
pub use deferred::DeferredSet;
pub use node::{Node, NodeSnapshot, NodeState, NodeStats};
pub use ordering::{NodeId, Request};
pub use release::ReleaseSummary;
pub use transport::{PeerReply, PeerSet, PeerTransport};
