//! Wire types for the coordination-store contract.
//!
//! Models the transaction, range and watch vocabulary of a lease-aware,
//! linearizable key-value store: every key carries the revision at which it
//! was first created, and transactions compare revisions before choosing a
//! branch. The fair mutex protocol is built entirely from these pieces.

use serde::Deserialize;
use serde::Serialize;

/// Store-assigned metadata returned with every response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHeader {
    /// The store's logical revision at the time the response was produced.
    pub revision: i64,
}

/// A key-value pair with revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Revision assigned when the key was first put. Never changes until the
    /// key is deleted and recreated.
    pub create_revision: i64,
    /// Revision of the most recent modification.
    pub mod_revision: i64,
    /// Per-key version counter, starting at 1 on creation.
    pub version: i64,
    /// Lease the key is attached to, or 0 for none.
    pub lease: i64,
}

/// Which revision field a transaction comparison inspects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareTarget {
    /// Compare the key's create revision. A missing key compares as 0.
    CreateRevision,
    /// Compare the key's mod revision.
    ModRevision,
    /// Compare the key's version counter.
    Version,
}

/// Comparison operator for transaction conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareOp {
    /// Target equals the given revision.
    Equal,
    /// Target differs from the given revision.
    NotEqual,
    /// Target is strictly greater.
    Greater,
    /// Target is strictly less.
    Less,
}

/// A single guard condition inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compare {
    /// Key whose metadata is inspected.
    pub key: String,
    /// Field under comparison.
    pub target: CompareTarget,
    /// Operator applied between the field and `revision`.
    pub op: CompareOp,
    /// Right-hand side of the comparison.
    pub revision: i64,
}

impl Compare {
    /// Condition on a key's create revision.
    ///
    /// `Compare::create_revision(key, CompareOp::Equal, 0)` is the
    /// "key is absent" guard used by the mutex acquisition transaction.
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision,
            op,
            revision,
        }
    }
}

/// Range selector for prefix queries.
///
/// The mutex protocol only ever needs the two ends of the create-revision
/// order, so the selector vocabulary is exactly that.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RangeSelect {
    /// The key under the prefix with the smallest create revision, i.e.
    /// the current lock owner.
    FirstCreate,
    /// The key under the prefix with the largest create revision that is
    /// still at most the given bound, i.e. the waiter's direct predecessor.
    LastCreateMax(i64),
}

/// Operations available inside a transaction branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnOp {
    /// Put a value, optionally attached to a lease (0 for none).
    Put {
        /// Key to write.
        key: String,
        /// Value to store.
        value: String,
        /// Lease to attach, or 0.
        lease: i64,
    },
    /// Read a single key.
    Get {
        /// Key to read.
        key: String,
    },
    /// Read one key under a prefix, chosen by the selector.
    Range {
        /// Prefix to query.
        prefix: String,
        /// Which key in create-revision order to return.
        select: RangeSelect,
    },
    /// Delete a single key.
    Delete {
        /// Key to delete.
        key: String,
    },
}

/// Result of one transaction operation, in branch order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnOpResult {
    /// A put happened at this revision.
    Put {
        /// Revision assigned to the write.
        revision: i64,
    },
    /// Result of a get; empty when the key is absent.
    Get {
        /// Matching entries (zero or one).
        kvs: Vec<KeyValue>,
    },
    /// Result of a range query; empty when no key matched the selector.
    Range {
        /// Matching entries (zero or one).
        kvs: Vec<KeyValue>,
    },
    /// Number of keys removed by a delete.
    Delete {
        /// Deleted key count.
        deleted: i64,
    },
}

/// An atomic compare-then-branch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnRequest {
    /// All conditions must hold for the success branch to run.
    pub compare: Vec<Compare>,
    /// Operations applied when every comparison passes.
    pub success: Vec<TxnOp>,
    /// Operations applied otherwise.
    pub failure: Vec<TxnOp>,
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnResponse {
    /// Store revision after the transaction.
    pub header: ResponseHeader,
    /// Whether the success branch ran.
    pub succeeded: bool,
    /// Per-operation results for the branch that ran.
    pub results: Vec<TxnOpResult>,
}

/// Response shared by point reads and range queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeResponse {
    /// Store revision at read time. Watches resumed from this revision see
    /// every event that follows the read.
    pub header: ResponseHeader,
    /// Matching entries.
    pub kvs: Vec<KeyValue>,
}

/// Kind of change a watch observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    /// The key was created or overwritten.
    Put,
    /// The key was deleted (explicitly or by lease expiry).
    Delete,
}

/// One change event on a watched key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub event_type: EventType,
    /// The affected entry. For deletes, the value is empty and the revision
    /// fields record the state at deletion time.
    pub kv: KeyValue,
}

/// A single renewal acknowledged by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeepAliveResponse {
    /// The renewed lease.
    pub lease_id: i64,
    /// Remaining time-to-live granted by this renewal.
    pub ttl_seconds: i64,
}
