//! Error types and gRPC status mapping.
//!
//! Three classes of failure matter to the protocol:
//! - transport errors degrade liveness only and never safety,
//! - protocol violations are rejected without touching node state,
//! - invariant violations are programming defects and are fatal to the
//!   local protocol instance.

use thiserror::Error;

/// Common mutual-exclusion error conditions.
#[derive(Debug, Clone, Error)]
pub enum MutexError {
    /// Peer unreachable or the RPC failed.
    #[error("transport error talking to {peer}: {message}")]
    Transport { peer: String, message: String },

    /// Malformed or self-addressed message.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Message names an identity outside the configured peer set.
    #[error("unknown peer: {peer}")]
    UnknownPeer { peer: String },

    /// Local state machine reached a state the protocol forbids.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Node is shutting down.
    #[error("node is shutting down")]
    Shutdown,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MutexError {
    /// Create a Transport error.
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a ProtocolViolation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create an InvariantViolation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this error must stop the local protocol instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// Result type using MutexError.
pub type MutexResult<T> = Result<T, MutexError>;

/// Convert a MutexError to a tonic Status.
pub fn mutex_error_to_status(e: MutexError) -> tonic::Status {
    use tonic::Status;

    match e {
        MutexError::ProtocolViolation { message } => Status::invalid_argument(message),
        MutexError::UnknownPeer { .. } => Status::invalid_argument(e.to_string()),
        MutexError::InvariantViolation { .. } => Status::internal(e.to_string()),
        MutexError::Internal { message } => Status::internal(message),
        MutexError::Transport { .. } | MutexError::Shutdown => Status::unavailable(e.to_string()),
    }
}

/// Convert a tonic Status received from `peer` into a MutexError.
///
/// `InvalidArgument` means the peer rejected the message itself, so
/// re-sending it cannot help. Every other status is a transport failure
/// from the caller's point of view. The status code and message are kept
/// for the log line.
pub fn status_to_mutex_error(peer: &str, status: &tonic::Status) -> MutexError {
    let detail = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        tonic::Code::InvalidArgument => {
            MutexError::protocol(format!("rejected by {}: {}", peer, detail))
        }
        _ => MutexError::transport(peer, detail),
    }
}
