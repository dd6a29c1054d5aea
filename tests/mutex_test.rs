//! End-to-end scenarios for the fair mutex over the deterministic store.

use std::sync::Arc;
use std::time::Duration;

use holdfast::kv::DeterministicKvStore;
use holdfast::kv::KvStore;
use holdfast::kv::RangeSelect;
use holdfast::LockError;
use holdfast::Mutex;
use holdfast::Session;
use holdfast::SessionOptions;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn new_session(store: &Arc<DeterministicKvStore>, ttl: i64) -> Arc<Session> {
    let stored: Arc<dyn KvStore> = store.clone();
    Arc::new(
        Session::new(stored, SessionOptions::new().with_ttl(ttl))
            .await
            .expect("session"),
    )
}

async fn queue_len(store: &Arc<DeterministicKvStore>, prefix: &str) -> usize {
    // The deterministic store returns at most one key per range query, so
    // count by walking the create-revision order from the top.
    let mut count = 0;
    let mut bound = i64::MAX;
    loop {
        let response = store.get_range(prefix, RangeSelect::LastCreateMax(bound)).await.unwrap();
        match response.kvs.first() {
            Some(kv) => {
                count += 1;
                bound = kv.create_revision - 1;
            }
            None => return count,
        }
    }
}

async fn wait_for_queue_len(store: &Arc<DeterministicKvStore>, prefix: &str, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue_len(store, prefix).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue never reached expected length");
}

/// Three contenders acquire in exactly the order their puts committed.
#[tokio::test]
async fn contenders_acquire_in_create_revision_order() {
    init_tracing();
    let store = DeterministicKvStore::new();
    let prefix = "jobs/x";

    let mut first = Mutex::new(new_session(&store, 30).await, prefix);
    first.lock(&CancellationToken::new()).await.unwrap();

    let (acquired_tx, mut acquired_rx) = mpsc::channel::<&'static str>(2);

    let mut waiters = Vec::new();
    for name in ["second", "third"] {
        let session = new_session(&store, 30).await;
        let acquired = acquired_tx.clone();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let enqueued_before = queue_len(&store, "jobs/x/").await;
        let handle = tokio::spawn(async move {
            let mut mutex = Mutex::new(session, "jobs/x");
            mutex.lock(&CancellationToken::new()).await.unwrap();
            acquired.send(name).await.unwrap();
            release_rx.await.unwrap();
            mutex.unlock(&CancellationToken::new()).await.unwrap();
        });
        // Let this waiter enqueue before starting the next so the put order
        // is second < third.
        wait_for_queue_len(&store, "jobs/x/", enqueued_before + 1).await;
        waiters.push((handle, release_tx));
    }

    // Nobody acquires while the first holder is in place.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), acquired_rx.recv())
            .await
            .is_err(),
        "a waiter acquired while the lock was held"
    );

    first.unlock(&CancellationToken::new()).await.unwrap();
    assert_eq!(acquired_rx.recv().await, Some("second"));

    // Releasing the second wakes exactly the third.
    let (second_handle, second_release) = waiters.remove(0);
    second_release.send(()).unwrap();
    second_handle.await.unwrap();
    assert_eq!(acquired_rx.recv().await, Some("third"));

    let (third_handle, third_release) = waiters.remove(0);
    third_release.send(()).unwrap();
    third_handle.await.unwrap();
}

/// A waiter whose lease dies mid-wait gets `SessionExpired`, not a watch
/// error.
#[tokio::test]
async fn lease_death_during_wait_is_session_expired() {
    init_tracing();
    let store = DeterministicKvStore::new();

    let mut holder = Mutex::new(new_session(&store, 30).await, "jobs/y");
    holder.lock(&CancellationToken::new()).await.unwrap();

    let waiter_session = new_session(&store, 5).await;
    let waiter_lease = waiter_session.lease_id();
    let waiter = tokio::spawn(async move {
        let mut mutex = Mutex::new(waiter_session, "jobs/y");
        mutex.lock(&CancellationToken::new()).await
    });
    wait_for_queue_len(&store, "jobs/y/", 2).await;

    // The waiter's backend connection goes dark long enough for the lease
    // to expire server-side.
    assert!(store.expire_lease(waiter_lease).await);
    wait_for_queue_len(&store, "jobs/y/", 1).await;

    holder.unlock(&CancellationToken::new()).await.unwrap();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(LockError::SessionExpired)), "got {result:?}");
}

/// At any instant at most one contender is inside the critical section.
#[tokio::test]
async fn mutual_exclusion_under_contention() {
    init_tracing();
    let store = DeterministicKvStore::new();
    let occupied = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = new_session(&store, 30).await;
        let occupied = occupied.clone();
        tasks.push(tokio::spawn(async move {
            let mut mutex = Mutex::new(session, "jobs/critical");
            for _ in 0..5 {
                mutex.lock(&CancellationToken::new()).await.unwrap();
                assert!(
                    !occupied.swap(true, std::sync::atomic::Ordering::SeqCst),
                    "two holders inside the critical section"
                );
                tokio::task::yield_now().await;
                occupied.store(false, std::sync::atomic::Ordering::SeqCst);
                mutex.unlock(&CancellationToken::new()).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

/// Cancelling a waiting `lock` returns promptly and leaves no queue entry
/// behind.
#[tokio::test]
async fn cancelled_waiter_cleans_up_its_entry() {
    init_tracing();
    let store = DeterministicKvStore::new();

    let mut holder = Mutex::new(new_session(&store, 30).await, "jobs/z");
    holder.lock(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter_cancel = cancel.clone();
    let waiter_session = new_session(&store, 30).await;
    let waiter = tokio::spawn(async move {
        let mut mutex = Mutex::new(waiter_session, "jobs/z");
        mutex.lock(&waiter_cancel).await
    });
    wait_for_queue_len(&store, "jobs/z/", 2).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(LockError::Cancelled)), "got {result:?}");

    // The abandoned queue slot must not block future contenders.
    wait_for_queue_len(&store, "jobs/z/", 1).await;
    holder.unlock(&CancellationToken::new()).await.unwrap();

    let mut next = Mutex::new(new_session(&store, 30).await, "jobs/z");
    next.try_lock(&CancellationToken::new()).await.unwrap();
    next.unlock(&CancellationToken::new()).await.unwrap();
}

/// A session can back several mutexes on different prefixes at once.
#[tokio::test]
async fn one_session_many_prefixes() {
    init_tracing();
    let store = DeterministicKvStore::new();
    let session = new_session(&store, 30).await;

    let mut a = Mutex::new(session.clone(), "locks/a");
    let mut b = Mutex::new(session.clone(), "locks/b");
    let cancel = CancellationToken::new();

    a.lock(&cancel).await.unwrap();
    b.lock(&cancel).await.unwrap();
    assert_ne!(a.key(), b.key());
    a.unlock(&cancel).await.unwrap();
    b.unlock(&cancel).await.unwrap();
}

/// Closing the session while holding the lock releases it for the next
/// contender (the lease takes the key with it).
#[tokio::test]
async fn closing_session_frees_the_lock() {
    init_tracing();
    let store = DeterministicKvStore::new();

    let holder_session = new_session(&store, 30).await;
    let mut holder = Mutex::new(holder_session.clone(), "jobs/w");
    holder.lock(&CancellationToken::new()).await.unwrap();

    let waiter_session = new_session(&store, 30).await;
    let waiter = tokio::spawn(async move {
        let mut mutex = Mutex::new(waiter_session, "jobs/w");
        mutex.lock(&CancellationToken::new()).await
    });
    wait_for_queue_len(&store, "jobs/w/", 2).await;

    holder_session.close().await.unwrap();
    waiter.await.unwrap().unwrap();
}
