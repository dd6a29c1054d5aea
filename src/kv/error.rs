//! Errors surfaced by coordination-store backends.

use snafu::Snafu;

/// Backend-level failure from a [`KvStore`](crate::kv::KvStore)
/// implementation.
///
/// These are the errors the store itself produces; the lock protocol wraps
/// them as [`LockError::Store`](crate::LockError::Store) so callers always
/// see the original cause.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KvError {
    /// The backend rejected or could not complete an operation.
    #[snafu(display("store operation failed: {reason}"))]
    Failed {
        /// Backend-provided description.
        reason: String,
    },

    /// An operation referenced a lease the store no longer tracks.
    #[snafu(display("lease {lease_id:x} not found"))]
    LeaseNotFound {
        /// The missing lease.
        lease_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_not_found_display_is_hex() {
        let err = KvError::LeaseNotFound { lease_id: 0x1f };
        assert_eq!(err.to_string(), "lease 1f not found");
    }

    #[test]
    fn failed_display_carries_reason() {
        let err = KvError::Failed {
            reason: "txn rejected".to_string(),
        };
        assert_eq!(err.to_string(), "store operation failed: txn rejected");
    }
}
