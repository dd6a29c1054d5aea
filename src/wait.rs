//! Predecessor waiting for the fair mutex.
//!
//! Each contender blocks on exactly one key at a time (the live key with
//! the largest create revision below its own), so a release wakes exactly
//! one waiter instead of the whole queue.

use std::future::Future;
use std::sync::Arc;

use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CancelledSnafu;
use crate::error::LockError;
use crate::error::LostWatcherSnafu;
use crate::error::StoreSnafu;
use crate::kv::EventType;
use crate::kv::KvError;
use crate::kv::KvStore;
use crate::kv::RangeSelect;

/// Run a store call under the caller's scope, surfacing cancellation
/// promptly instead of waiting out a slow backend.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, KvError>>,
) -> Result<T, LockError> {
    tokio::select! {
        _ = cancel.cancelled() => CancelledSnafu.fail(),
        result = operation => result.context(StoreSnafu),
    }
}

/// Block until `key` is deleted, watching from `from_revision`.
///
/// Starting the watch at the revision of the read that observed the key
/// closes the race where the delete lands between the read and the watch.
pub(crate) async fn wait_delete(
    store: &Arc<dyn KvStore>,
    cancel: &CancellationToken,
    key: &str,
    from_revision: i64,
) -> Result<(), LockError> {
    let watch_cancel = cancel.child_token();
    let mut events = cancellable(cancel, store.watch(watch_cancel.clone(), key, from_revision)).await?;
    // Tear the watch down on every exit path.
    let _guard = watch_cancel.clone().drop_guard();

    while let Some(event) = events.recv().await {
        match event {
            Ok(event) if event.event_type == EventType::Delete => return Ok(()),
            Ok(_) => continue,
            Err(source) => return Err(LockError::Store { source }),
        }
    }

    if cancel.is_cancelled() {
        return CancelledSnafu.fail();
    }
    // The stream ended without a delete, an error, or a cancellation.
    LostWatcherSnafu { key }.fail()
}

/// Wait until no key under `prefix` has a create revision at or below
/// `max_create_revision`.
///
/// Repeatedly finds the youngest such key and awaits its deletion; when the
/// query comes back empty the caller is at the head of the queue.
pub(crate) async fn wait_deletes(
    store: &Arc<dyn KvStore>,
    cancel: &CancellationToken,
    prefix: &str,
    max_create_revision: i64,
) -> Result<(), LockError> {
    loop {
        let response = cancellable(
            cancel,
            store.get_range(prefix, RangeSelect::LastCreateMax(max_create_revision)),
        )
        .await?;
        let Some(predecessor) = response.kvs.first() else {
            return Ok(());
        };
        debug!(
            prefix,
            predecessor = %predecessor.key,
            create_revision = predecessor.create_revision,
            "waiting on predecessor"
        );
        wait_delete(store, cancel, &predecessor.key, response.header.revision).await?;
    }
}
