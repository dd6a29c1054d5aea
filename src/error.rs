//! The caller-facing error taxonomy.

use std::time::Duration;

use snafu::Snafu;

use crate::kv::KvError;
use crate::redis::ClientError;

/// Everything a lock operation can fail with.
///
/// Backend failures keep their original cause attached as a `source`; the
/// remaining variants are protocol outcomes in their own right.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// `try_lock` found the mutex held by another session. Local state has
    /// been rolled back; the handle can retry.
    #[snafu(display("mutex is locked by another session"))]
    AlreadyLocked,

    /// The session's lease expired while waiting for predecessors.
    #[snafu(display("session lease expired while waiting for the lock"))]
    SessionExpired,

    /// `unlock` was called on a mutex that is not currently held.
    #[snafu(display("lock has already been released"))]
    AlreadyReleased,

    /// A defensive check failed; the handle's key does not belong to its
    /// prefix.
    #[snafu(display("invalid key {key:?}, expected prefix {prefix:?}"))]
    InvariantViolation {
        /// The offending key.
        key: String,
        /// The prefix it was expected to carry.
        prefix: String,
    },

    /// The conditional set found the key already taken (non-blocking mode).
    #[snafu(display("lock is held by another owner"))]
    LockNotHeld,

    /// The blocking-acquisition budget elapsed without the key freeing up.
    #[snafu(display("gave up acquiring lock after {waited_ms}ms"))]
    BlockingTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The unlock script found the key missing or carrying someone else's
    /// token: the lock expired or was stolen.
    #[snafu(display("lock is no longer owned by this token"))]
    NotOwner,

    /// Fewer than a majority of quorum members granted the lock in budget.
    #[snafu(display("quorum not met: acquired {acquired} of {required} required"))]
    QuorumNotMet {
        /// Children acquired within their per-node budget.
        acquired: usize,
        /// Majority threshold, ⌊N/2⌋+1.
        required: usize,
    },

    /// A quorum lock needs at least three members.
    #[snafu(display("quorum lock needs at least 3 nodes, got {count}"))]
    TooFewNodes {
        /// Configured member count.
        count: usize,
    },

    /// The per-node acquisition budget is too large a fraction of the lock
    /// lifetime.
    #[snafu(display(
        "timing budget too tight: {nodes} nodes x {single_node_timeout:?} x 10 exceeds expiry {expire_duration:?}"
    ))]
    TimingBudgetTooTight {
        /// Configured member count.
        nodes: usize,
        /// Per-node acquisition timeout.
        single_node_timeout: Duration,
        /// Total lock lifetime.
        expire_duration: Duration,
    },

    /// A watch stream ended without a delete event or a terminal error.
    #[snafu(display("lost watcher waiting for delete of {key:?}"))]
    LostWatcher {
        /// The watched key.
        key: String,
    },

    /// The coordination store failed.
    #[snafu(display("coordination store error"))]
    Store {
        /// The backend failure.
        source: KvError,
    },

    /// The key-server client failed.
    #[snafu(display("key-server client error"))]
    Client {
        /// The backend failure.
        source: ClientError,
    },

    /// The caller's scope was cancelled.
    #[snafu(display("operation cancelled"))]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_display_counts() {
        let err = LockError::QuorumNotMet {
            acquired: 2,
            required: 3,
        };
        assert_eq!(err.to_string(), "quorum not met: acquired 2 of 3 required");
    }

    #[test]
    fn store_error_keeps_source() {
        let err = LockError::Store {
            source: KvError::Failed {
                reason: "boom".into(),
            },
        };
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "store operation failed: boom");
    }

    #[test]
    fn invariant_violation_names_both_sides() {
        let err = LockError::InvariantViolation {
            key: "other/1".into(),
            prefix: "jobs/".into(),
        };
        assert!(err.to_string().contains("other/1"));
        assert!(err.to_string().contains("jobs/"));
    }
}
