//! Lease-backed sessions over a coordination store.
//!
//! A [`Session`] owns a lease and keeps it alive in the background. Locks
//! bind their keys to the session's lease, so a crashed holder's keys vanish
//! when the lease stops being renewed. That is the crash-safety story of
//! the whole kv lock family.

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::CancelledSnafu;
use crate::error::LockError;
use crate::error::StoreSnafu;
use crate::kv::KvStore;

/// Default session TTL in seconds.
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 60;

/// Configuration for [`Session::new`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    ttl_seconds: Option<i64>,
    lease_id: Option<i64>,
    parent: Option<CancellationToken>,
}

impl SessionOptions {
    /// Start from the defaults: a fresh lease with a 60 second TTL, scoped
    /// to a root cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease TTL. Values of zero or less are rejected with a warning
    /// and the current TTL is kept.
    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        if ttl_seconds > 0 {
            self.ttl_seconds = Some(ttl_seconds);
        } else {
            warn!(
                requested = ttl_seconds,
                current = self.ttl_seconds.unwrap_or(DEFAULT_SESSION_TTL_SECONDS),
                "session TTL must be > 0, keeping current TTL"
            );
        }
        self
    }

    /// Adopt an existing lease instead of granting a new one. The caller
    /// remains responsible for the TTL that lease was granted with.
    pub fn with_lease(mut self, lease_id: i64) -> Self {
        self.lease_id = Some(lease_id);
        self
    }

    /// Scope the session under a parent cancellation token. Cancelling the
    /// parent orphans the session.
    pub fn with_context(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// A live lease plus the loop that keeps it alive.
///
/// While the session is live its lease is being renewed; once [`done`]
/// fires, renewal has stopped for good and the lease is either revoked or
/// drifting toward expiry. One session can back any number of
/// [`Mutex`](crate::Mutex) instances.
///
/// [`done`]: Session::done
pub struct Session {
    store: Arc<dyn KvStore>,
    lease_id: i64,
    ttl_seconds: i64,
    cancel: CancellationToken,
    done: CancellationToken,
    keep_alive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session: grant (or adopt) a lease and start the keep-alive
    /// loop.
    pub async fn new(store: Arc<dyn KvStore>, options: SessionOptions) -> Result<Self, LockError> {
        let ttl_seconds = options.ttl_seconds.unwrap_or(DEFAULT_SESSION_TTL_SECONDS);
        let lease_id = match options.lease_id {
            Some(adopted) => adopted,
            None => store.grant(ttl_seconds).await.context(StoreSnafu)?,
        };

        let cancel = options.parent.unwrap_or_default().child_token();
        let done = CancellationToken::new();

        let mut responses = store.keep_alive(cancel.clone(), lease_id).await.context(StoreSnafu)?;

        // The loop only drains the stream; liveness is the backend's job.
        // When the stream closes (cancellation, revocation, or a dead
        // backend) renewal is over, so signal done and tear the scope down.
        let loop_cancel = cancel.clone();
        let loop_done = done.clone();
        let keep_alive_task = tokio::spawn(async move {
            while responses.recv().await.is_some() {}
            debug!(lease_id, "keep-alive stream closed");
            loop_done.cancel();
            loop_cancel.cancel();
        });

        Ok(Self {
            store,
            lease_id,
            ttl_seconds,
            cancel,
            done,
            keep_alive_task: std::sync::Mutex::new(Some(keep_alive_task)),
        })
    }

    /// The store this session renews against.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// The lease this session owns.
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// The TTL the lease was granted with.
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// A one-shot signal that fires when keep-alive terminates.
    ///
    /// `session.done().cancelled().await` resolves once the lease has
    /// stopped being renewed.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Stop renewing and wait for the keep-alive loop to exit. The lease is
    /// left to expire naturally on the server.
    pub async fn orphan(&self) {
        self.cancel.cancel();
        let task = self.keep_alive_task.lock().expect("keep-alive handle poisoned").take();
        if let Some(task) = task {
            // The loop never panics; a join error only occurs on forced
            // runtime teardown.
            let _ = task.await;
        }
        self.done.cancelled().await;
    }

    /// Orphan the session, then eagerly revoke the lease.
    ///
    /// Revocation runs under a fresh scope bounded by the lease TTL; past
    /// that point the lease would have expired on its own anyway.
    pub async fn close(&self) -> Result<(), LockError> {
        self.orphan().await;
        let deadline = Duration::from_secs(self.ttl_seconds.max(0) as u64);
        match tokio::time::timeout(deadline, self.store.revoke(self.lease_id)).await {
            Ok(result) => result.context(StoreSnafu),
            Err(_) => CancelledSnafu.fail(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease_id", &format_args!("{:x}", self.lease_id))
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::DeterministicKvStore;

    #[tokio::test(start_paused = true)]
    async fn session_keeps_lease_alive_past_ttl() {
        let store = DeterministicKvStore::new();
        let session = Session::new(store.clone(), SessionOptions::new().with_ttl(2))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        // Revoking succeeds only if the lease still exists.
        assert!(store.revoke(session.lease_id()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn done_fires_when_lease_dies_server_side() {
        let store = DeterministicKvStore::new();
        let session = Session::new(store.clone(), SessionOptions::new().with_ttl(5))
            .await
            .unwrap();

        let done = session.done();
        assert!(!done.is_cancelled());

        store.expire_lease(session.lease_id()).await;
        // The keep-alive stream notices the missing lease on its next tick.
        tokio::time::timeout(Duration::from_secs(10), done.cancelled())
            .await
            .expect("done should fire after server-side expiry");
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_stops_renewal_but_leaves_lease() {
        let store = DeterministicKvStore::new();
        let session = Session::new(store.clone(), SessionOptions::new().with_ttl(4))
            .await
            .unwrap();

        session.orphan().await;
        // Immediately after orphaning the lease is still there…
        assert!(store.expire_lease(session.lease_id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn close_revokes_eagerly() {
        let store = DeterministicKvStore::new();
        let session = Session::new(store.clone(), SessionOptions::new().with_ttl(30))
            .await
            .unwrap();

        session.close().await.unwrap();
        // Lease is gone well before its TTL.
        assert!(!store.expire_lease(session.lease_id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_lease_is_renewed_not_granted() {
        let store = DeterministicKvStore::new();
        let lease_id = store.grant(3).await.unwrap();
        let session = Session::new(store.clone(), SessionOptions::new().with_lease(lease_id))
            .await
            .unwrap();
        assert_eq!(session.lease_id(), lease_id);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(store.revoke(lease_id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_orphans_the_session() {
        let store = DeterministicKvStore::new();
        let parent = CancellationToken::new();
        let session = Session::new(
            store.clone(),
            SessionOptions::new().with_ttl(4).with_context(parent.clone()),
        )
        .await
        .unwrap();

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), session.done().cancelled())
            .await
            .expect("done should fire after parent cancellation");
    }
}
