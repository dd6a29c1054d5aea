//! The coordination-store trait consumed by the kv lock family.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::kv::error::KvError;
use crate::kv::types::KeepAliveResponse;
use crate::kv::types::RangeResponse;
use crate::kv::types::RangeSelect;
use crate::kv::types::TxnRequest;
use crate::kv::types::TxnResponse;
use crate::kv::types::WatchEvent;

/// Lease-aware, watch-capable, transactional key-value store.
///
/// This is the contract the [`Session`](crate::Session) and
/// [`Mutex`](crate::Mutex) build on. Implementations must provide
/// linearizable transactions and assign every key a monotonically
/// increasing create revision on its first put; the fairness of the mutex
/// protocol is exactly the fairness of that assignment.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Grant a new lease with the given time-to-live, returning its id.
    async fn grant(&self, ttl_seconds: i64) -> Result<i64, KvError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease_id: i64) -> Result<(), KvError>;

    /// Open a keep-alive stream for a lease.
    ///
    /// The stream yields one response per successful renewal. It closes when
    /// the lease dies, the token is cancelled, or the backend shuts the
    /// stream down; the store performs no renewal once the stream is closed.
    async fn keep_alive(
        &self,
        cancel: CancellationToken,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>, KvError>;

    /// Commit an atomic compare-then-branch transaction.
    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KvError>;

    /// Read a single key. An absent key yields an empty `kvs`, not an error.
    async fn get(&self, key: &str) -> Result<RangeResponse, KvError>;

    /// Read one key under a prefix according to the selector.
    async fn get_range(&self, prefix: &str, select: RangeSelect) -> Result<RangeResponse, KvError>;

    /// Delete a key, returning how many entries were removed.
    async fn delete(&self, key: &str) -> Result<i64, KvError>;

    /// Watch a key for changes starting at `from_revision`.
    ///
    /// Events already committed at or after `from_revision` are replayed
    /// before live events, so a watch opened from a read's header revision
    /// cannot miss a change that races the read. A terminal backend failure
    /// arrives as an `Err` item; cancellation or shutdown closes the channel
    /// without one.
    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<Result<WatchEvent, KvError>>, KvError>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn grant(&self, ttl_seconds: i64) -> Result<i64, KvError> {
        (**self).grant(ttl_seconds).await
    }

    async fn revoke(&self, lease_id: i64) -> Result<(), KvError> {
        (**self).revoke(lease_id).await
    }

    async fn keep_alive(
        &self,
        cancel: CancellationToken,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>, KvError> {
        (**self).keep_alive(cancel, lease_id).await
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KvError> {
        (**self).txn(request).await
    }

    async fn get(&self, key: &str) -> Result<RangeResponse, KvError> {
        (**self).get(key).await
    }

    async fn get_range(&self, prefix: &str, select: RangeSelect) -> Result<RangeResponse, KvError> {
        (**self).get_range(prefix, select).await
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        (**self).delete(key).await
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<Result<WatchEvent, KvError>>, KvError> {
        (**self).watch(cancel, key, from_revision).await
    }
}
