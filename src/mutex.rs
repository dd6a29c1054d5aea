//! Fair distributed mutex over a coordination store.
//!
//! Contenders enqueue by putting a session-scoped key under a shared prefix
//! in one atomic transaction; the holder is whoever owns the key with the
//! smallest create revision. Waiters block on their direct predecessor, so
//! acquisition order is exactly the order the store committed the puts.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AlreadyLockedSnafu;
use crate::error::AlreadyReleasedSnafu;
use crate::error::InvariantViolationSnafu;
use crate::error::LockError;
use crate::error::SessionExpiredSnafu;
use crate::kv::Compare;
use crate::kv::CompareOp;
use crate::kv::KeyValue;
use crate::kv::RangeSelect;
use crate::kv::ResponseHeader;
use crate::kv::TxnOp;
use crate::kv::TxnOpResult;
use crate::kv::TxnRequest;
use crate::session::Session;
use crate::wait::cancellable;
use crate::wait::wait_deletes;

/// Where a mutex handle stands in the acquisition protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HeldState {
    /// No key under the prefix belongs to this handle.
    Unheld,
    /// Our key is enqueued but a predecessor still holds the lock.
    Pending { key: String, rev: i64 },
    /// Our key has the smallest create revision; we own the lock.
    Held { key: String, rev: i64 },
}

/// A fair, session-backed distributed mutex.
///
/// One handle serves one caller: operations take `&mut self` and must not be
/// raced from multiple tasks. The key a handle enqueues is tied to its
/// session's lease, so a crashed holder releases the lock when the lease
/// expires.
pub struct Mutex {
    session: Arc<Session>,
    prefix: String,
    state: HeldState,
    header: Option<ResponseHeader>,
}

impl Mutex {
    /// Create a mutex handle on `prefix`, backed by `session`.
    ///
    /// The prefix is the lock's logical name; a trailing `/` is appended to
    /// keep contender keys under a common directory.
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            session,
            prefix,
            state: HeldState::Unheld,
            header: None,
        }
    }

    /// The key this handle enqueues under the prefix.
    fn my_key(&self) -> String {
        format!("{}{:x}", self.prefix, self.session.lease_id())
    }

    /// Enqueue (or observe our existing entry) and learn the current owner.
    ///
    /// One transaction: if our key is absent, put it under the session lease
    /// and read the owner; otherwise read our existing entry and the owner.
    /// Afterwards the handle is `Pending` at its create revision.
    async fn try_acquire(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(ResponseHeader, Vec<KeyValue>, i64), LockError> {
        let key = self.my_key();
        let request = TxnRequest {
            compare: vec![Compare::create_revision(&key, CompareOp::Equal, 0)],
            success: vec![
                TxnOp::Put {
                    key: key.clone(),
                    value: String::new(),
                    lease: self.session.lease_id(),
                },
                TxnOp::Range {
                    prefix: self.prefix.clone(),
                    select: RangeSelect::FirstCreate,
                },
            ],
            failure: vec![
                TxnOp::Get { key: key.clone() },
                TxnOp::Range {
                    prefix: self.prefix.clone(),
                    select: RangeSelect::FirstCreate,
                },
            ],
        };

        let response = cancellable(cancel, self.session.store().txn(request)).await?;

        let rev = if response.succeeded {
            response.header.revision
        } else {
            match response.results.first() {
                Some(TxnOpResult::Get { kvs }) if !kvs.is_empty() => kvs[0].create_revision,
                _ => {
                    return Err(LockError::Store {
                        source: crate::kv::KvError::Failed {
                            reason: "acquire transaction returned no entry for our key".to_string(),
                        },
                    });
                }
            }
        };
        self.state = HeldState::Pending { key, rev };

        let owner = match response.results.get(1) {
            Some(TxnOpResult::Range { kvs }) => kvs.clone(),
            _ => Vec::new(),
        };
        Ok((response.header, owner, rev))
    }

    /// True when the owner range query says the entry at `rev` heads the
    /// queue.
    fn owns(owner: &[KeyValue], rev: i64) -> bool {
        owner.is_empty() || owner[0].create_revision == rev
    }

    fn promote(&mut self, header: ResponseHeader) {
        if let HeldState::Pending { key, rev } = &self.state {
            self.state = HeldState::Held {
                key: key.clone(),
                rev: *rev,
            };
        }
        self.header = Some(header);
    }

    /// Acquire without waiting.
    ///
    /// Fails with [`LockError::AlreadyLocked`] when another session holds
    /// the lock; our queue entry is deleted (best effort) so no stale waiter
    /// slot is left behind.
    pub async fn try_lock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let (header, owner, rev) = self.try_acquire(cancel).await?;
        if Self::owns(&owner, rev) {
            self.promote(header);
            debug!(prefix = %self.prefix, "mutex acquired without waiting");
            return Ok(());
        }

        let key = self.my_key();
        if let Err(error) = self.session.store().delete(&key).await {
            debug!(key = %key, error = %error, "failed to clean up queue entry after lost try_lock");
        }
        self.state = HeldState::Unheld;
        AlreadyLockedSnafu.fail()
    }

    /// Acquire, waiting in line behind earlier contenders.
    ///
    /// Waiters block on their direct predecessor's deletion; once at the
    /// head of the queue the handle re-reads its own key to make sure the
    /// session outlived the wait, failing with
    /// [`LockError::SessionExpired`] otherwise.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let (header, owner, rev) = self.try_acquire(cancel).await?;
        if Self::owns(&owner, rev) {
            self.promote(header);
            debug!(prefix = %self.prefix, "mutex acquired without waiting");
            return Ok(());
        }

        let store = self.session.store().clone();
        let prefix = self.prefix.clone();
        if let Err(wait_error) = wait_deletes(&store, cancel, &prefix, rev - 1).await {
            // The wait failed (cancelled, store error, lost watcher); drop
            // our queue slot under the base scope so the line moves on. The
            // wait error is the one worth reporting.
            let _ = self.unlock(&CancellationToken::new()).await;
            return Err(wait_error);
        }

        // Head of the queue. If our key is gone, the lease expired while we
        // waited and the lock was never ours.
        let key = self.my_key();
        let read = match cancellable(cancel, store.get(&key)).await {
            Ok(read) => read,
            Err(read_error) => {
                let _ = self.unlock(&CancellationToken::new()).await;
                return Err(read_error);
            }
        };
        if read.kvs.is_empty() {
            self.state = HeldState::Unheld;
            return SessionExpiredSnafu.fail();
        }
        self.promote(read.header);
        debug!(prefix = %self.prefix, "mutex acquired after waiting");
        Ok(())
    }

    /// Release the lock (or abandon a pending queue entry).
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let key = match &self.state {
            HeldState::Unheld => return AlreadyReleasedSnafu.fail(),
            HeldState::Pending { key, .. } | HeldState::Held { key, .. } => key.clone(),
        };
        if !key.starts_with(&self.prefix) {
            return InvariantViolationSnafu {
                key,
                prefix: self.prefix.clone(),
            }
            .fail();
        }
        cancellable(cancel, self.session.store().delete(&key)).await?;
        self.state = HeldState::Unheld;
        self.header = None;
        debug!(prefix = %self.prefix, "mutex released");
        Ok(())
    }

    /// A comparator other transactions can embed to run only while this
    /// handle still owns the lock: "create revision of my key equals the
    /// revision I acquired at". While unheld the comparison can never pass.
    pub fn is_owner(&self) -> Compare {
        let rev = match &self.state {
            HeldState::Held { rev, .. } | HeldState::Pending { rev, .. } => *rev,
            HeldState::Unheld => -1,
        };
        Compare::create_revision(self.my_key(), CompareOp::Equal, rev)
    }

    /// The queue key this handle occupies, if any.
    pub fn key(&self) -> Option<&str> {
        match &self.state {
            HeldState::Pending { key, .. } | HeldState::Held { key, .. } => Some(key),
            HeldState::Unheld => None,
        }
    }

    /// Header of the response that granted the lock, usable as a
    /// linearizable-read witness.
    pub fn header(&self) -> Option<ResponseHeader> {
        self.header
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("prefix", &self.prefix)
            .field("state", &self.state)
            .finish()
    }
}

/// Two-method adapter over [`Mutex`] for call sites that expect infallible
/// locking.
///
/// Both methods run under the session's base scope and **panic** on any
/// protocol or backend error. Use the underlying [`Mutex`] directly when
/// errors need handling.
pub struct Locker {
    mutex: Mutex,
}

impl Locker {
    /// Wrap a new mutex on `prefix` into the panicking adapter.
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        Self {
            mutex: Mutex::new(session, prefix),
        }
    }

    /// Acquire, panicking on failure.
    pub async fn lock(&mut self) {
        if let Err(error) = self.mutex.lock(&CancellationToken::new()).await {
            panic!("locker failed to acquire: {error}");
        }
    }

    /// Release, panicking on failure.
    pub async fn unlock(&mut self) {
        if let Err(error) = self.mutex.unlock(&CancellationToken::new()).await {
            panic!("locker failed to release: {error}");
        }
    }
}
