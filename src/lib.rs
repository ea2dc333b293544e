//! ramutex - Ricart-Agrawala distributed mutual exclusion over gRPC.
//!
//! A fixed set of nodes coordinates exclusive access to a shared critical
//! section without a central coordinator. Every request carries a Lamport
//! timestamp; requests are totally ordered by `(timestamp, node id)` and a
//! node enters the critical section only after every peer has granted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Runtime / CLI                               │
//! │      config │ scheduling loop │ peer connections │ shutdown      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     gRPC (mutex.MutexService)                   │
//! │          RequestAccess │ ReleaseAccess │ per-peer clients        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Engine                                      │
//! │   Lamport clock │ request order │ state machine │ deferred set   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::error`] - Error types and mapping
//!
//! ## Engine
//! - [`engine::clock`] - Lamport clock
//! - [`engine::ordering`] - Request priority
//! - [`engine::node`] - State machine and inbound handlers
//! - [`engine::acquire`] - Acquisition fan-out
//! - [`engine::release`] - Release broadcast
//!
//! ## Networking
//! - [`net::proto`] - Wire messages
//! - [`net::server`] - gRPC service
//! - [`net::client`] - gRPC peer transport
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - At most one node is `HELD` at any instant.
//! - A node's clock never decreases.
//! - A node never defers a request it has priority below.
//! - Deferred peers are granted exactly once, on release.

// Core infrastructure
pub mod core;

// Mutual-exclusion engine
pub mod engine;

// Networking
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use engine::{HeldSection, LogicalTimestamp, Node, NodeId, NodeState, PeerTransport, Request};
pub use net::{client, proto, server};
