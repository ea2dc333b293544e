//! Networking layer.
//!
//! This module carries the protocol over gRPC:
//! - [`proto`] - Wire messages for `mutex.MutexService`
//! - `framing` - Length-prefixed unary frames and responses
//! - [`server`] - Inbound service and listener
//! - [`client`] - Outbound per-peer transport with optional retry

pub mod client;
mod framing;
pub mod proto;
pub mod server;
