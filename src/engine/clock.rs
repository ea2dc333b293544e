//! Lamport logical clock.
//!
//! `tick` stamps locally originated events (sending a request, sending a
//! release). `merge` applies the receive rule `max(local, received) + 1`.
//! The clock never decreases.
//!
//! The clock carries no lock of its own: it lives inside the node core and
//! every update happens under the node lock, atomically with the state
//! transition it accompanies.

use serde::{Deserialize, Serialize};

/// A Lamport timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTimestamp(u64);

impl LogicalTimestamp {
    /// Create a timestamp from a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The initial timestamp of every clock.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

impl From<u64> for LogicalTimestamp {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Monotonic Lamport counter.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    current: LogicalTimestamp,
}

impl LamportClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, without advancing.
    pub fn current(&self) -> LogicalTimestamp {
        self.current
    }

    /// Advance for a local event and return the new value.
    pub fn tick(&mut self) -> LogicalTimestamp {
        self.current = LogicalTimestamp(self.current.0.saturating_add(1));
        self.current
    }

    /// Merge a received timestamp and return the new value.
    pub fn merge(&mut self, received: LogicalTimestamp) -> LogicalTimestamp {
        let base = self.current.max(received);
        self.current = LogicalTimestamp(base.0.saturating_add(1));
        self.current
    }
}
