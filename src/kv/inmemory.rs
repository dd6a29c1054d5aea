//! In-memory deterministic implementation of [`KvStore`] for testing.
//!
//! Mirrors the behavior of a production coordination store without network
//! I/O: a global revision counter, per-key create/mod/version bookkeeping,
//! leases with deadlines and a background sweeper, keep-alive streams, and
//! watches that replay history from a requested revision. Runs entirely on
//! the tokio clock, so tests under `start_paused = true` exercise lease
//! expiry and watch timing deterministically.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kv::error::FailedSnafu;
use crate::kv::error::KvError;
use crate::kv::error::LeaseNotFoundSnafu;
use crate::kv::store::KvStore;
use crate::kv::types::Compare;
use crate::kv::types::CompareOp;
use crate::kv::types::CompareTarget;
use crate::kv::types::EventType;
use crate::kv::types::KeepAliveResponse;
use crate::kv::types::KeyValue;
use crate::kv::types::RangeResponse;
use crate::kv::types::RangeSelect;
use crate::kv::types::ResponseHeader;
use crate::kv::types::TxnOp;
use crate::kv::types::TxnOpResult;
use crate::kv::types::TxnRequest;
use crate::kv::types::TxnResponse;
use crate::kv::types::WatchEvent;

/// How often the sweeper checks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the broadcast channel fanning events out to watchers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
    lease: i64,
}

impl Entry {
    fn to_kv(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        }
    }
}

#[derive(Debug)]
struct Lease {
    ttl_seconds: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Clone)]
struct LoggedEvent {
    revision: i64,
    event: WatchEvent,
}

#[derive(Default)]
struct State {
    revision: i64,
    keys: BTreeMap<String, Entry>,
    leases: HashMap<i64, Lease>,
    next_lease_id: i64,
    log: Vec<LoggedEvent>,
}

impl State {
    /// Record an event in the history log and fan it out to live watchers.
    fn emit(&mut self, tx: &broadcast::Sender<LoggedEvent>, revision: i64, event: WatchEvent) {
        let logged = LoggedEvent { revision, event };
        self.log.push(logged.clone());
        // No receivers is fine; history replay covers late watchers.
        let _ = tx.send(logged);
    }

    fn delete_key(&mut self, tx: &broadcast::Sender<LoggedEvent>, key: &str, revision: i64) -> bool {
        match self.keys.remove(key) {
            Some(entry) => {
                if entry.lease != 0 {
                    if let Some(lease) = self.leases.get_mut(&entry.lease) {
                        lease.keys.remove(key);
                    }
                }
                let mut kv = entry.to_kv(key);
                kv.value = String::new();
                kv.mod_revision = revision;
                self.emit(
                    tx,
                    revision,
                    WatchEvent {
                        event_type: EventType::Delete,
                        kv,
                    },
                );
                true
            }
            None => false,
        }
    }

    fn put_key(&mut self, tx: &broadcast::Sender<LoggedEvent>, key: &str, value: &str, lease: i64, revision: i64) {
        let entry = match self.keys.get_mut(key) {
            Some(existing) => {
                if existing.lease != 0 && existing.lease != lease {
                    if let Some(old) = self.leases.get_mut(&existing.lease) {
                        old.keys.remove(key);
                    }
                }
                existing.value = value.to_string();
                existing.mod_revision = revision;
                existing.version += 1;
                existing.lease = lease;
                existing.clone()
            }
            None => {
                let entry = Entry {
                    value: value.to_string(),
                    create_revision: revision,
                    mod_revision: revision,
                    version: 1,
                    lease,
                };
                self.keys.insert(key.to_string(), entry.clone());
                entry
            }
        };
        if lease != 0 {
            if let Some(holder) = self.leases.get_mut(&lease) {
                holder.keys.insert(key.to_string());
            }
        }
        self.emit(
            tx,
            revision,
            WatchEvent {
                event_type: EventType::Put,
                kv: entry.to_kv(key),
            },
        );
    }

    /// Drop a lease and delete everything attached to it, under one revision.
    fn remove_lease(&mut self, tx: &broadcast::Sender<LoggedEvent>, lease_id: i64) -> bool {
        match self.leases.remove(&lease_id) {
            Some(lease) => {
                if !lease.keys.is_empty() {
                    self.revision += 1;
                    let revision = self.revision;
                    for key in lease.keys {
                        self.delete_key(tx, &key, revision);
                    }
                }
                true
            }
            None => false,
        }
    }

    fn compare(&self, cmp: &Compare) -> bool {
        let actual = match self.keys.get(&cmp.key) {
            Some(entry) => match cmp.target {
                CompareTarget::CreateRevision => entry.create_revision,
                CompareTarget::ModRevision => entry.mod_revision,
                CompareTarget::Version => entry.version,
            },
            None => 0,
        };
        match cmp.op {
            CompareOp::Equal => actual == cmp.revision,
            CompareOp::NotEqual => actual != cmp.revision,
            CompareOp::Greater => actual > cmp.revision,
            CompareOp::Less => actual < cmp.revision,
        }
    }

    fn select_range(&self, prefix: &str, select: RangeSelect) -> Vec<KeyValue> {
        let candidates = self
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix));
        let chosen = match select {
            RangeSelect::FirstCreate => candidates.min_by_key(|(_, e)| e.create_revision),
            RangeSelect::LastCreateMax(max) => candidates
                .filter(|(_, e)| e.create_revision <= max)
                .max_by_key(|(_, e)| e.create_revision),
        };
        chosen.map(|(k, e)| vec![e.to_kv(k)]).unwrap_or_default()
    }
}

/// In-memory deterministic coordination store.
///
/// Useful for unit tests and simulation: leases expire on the tokio clock,
/// watches replay history from any revision, and transactions evaluate the
/// full comparison vocabulary. Create with [`DeterministicKvStore::new`] and
/// share via the returned `Arc`.
pub struct DeterministicKvStore {
    inner: Arc<Mutex<State>>,
    events: broadcast::Sender<LoggedEvent>,
    sweeper: CancellationToken,
}

impl DeterministicKvStore {
    /// Create a new store and start its lease sweeper.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner: Arc<Mutex<State>> = Arc::default();
        let sweeper = CancellationToken::new();

        let sweep_state = inner.clone();
        let sweep_events = events.clone();
        let sweep_cancel = sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let now = Instant::now();
                let mut state = sweep_state.lock().await;
                let expired: Vec<i64> = state
                    .leases
                    .iter()
                    .filter(|(_, lease)| lease.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for lease_id in expired {
                    debug!(lease_id, "lease expired, deleting attached keys");
                    state.remove_lease(&sweep_events, lease_id);
                }
            }
        });

        Arc::new(Self { inner, events, sweeper })
    }

    /// Force a lease to expire immediately, as if its holder went dark past
    /// the TTL. Test hook.
    pub async fn expire_lease(&self, lease_id: i64) -> bool {
        let mut state = self.inner.lock().await;
        state.remove_lease(&self.events, lease_id)
    }

    /// The store's current revision. Test hook.
    pub async fn current_revision(&self) -> i64 {
        self.inner.lock().await.revision
    }

    fn apply_ops(&self, state: &mut State, ops: &[TxnOp]) -> Vec<TxnOpResult> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    state.revision += 1;
                    let revision = state.revision;
                    state.put_key(&self.events, key, value, *lease, revision);
                    results.push(TxnOpResult::Put { revision });
                }
                TxnOp::Get { key } => {
                    let kvs = state.keys.get(key).map(|e| vec![e.to_kv(key)]).unwrap_or_default();
                    results.push(TxnOpResult::Get { kvs });
                }
                TxnOp::Range { prefix, select } => {
                    let kvs = state.select_range(prefix, *select);
                    results.push(TxnOpResult::Range { kvs });
                }
                TxnOp::Delete { key } => {
                    state.revision += 1;
                    let revision = state.revision;
                    let deleted = if state.delete_key(&self.events, key, revision) { 1 } else { 0 };
                    results.push(TxnOpResult::Delete { deleted });
                }
            }
        }
        results
    }
}

impl Drop for DeterministicKvStore {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[async_trait]
impl KvStore for DeterministicKvStore {
    async fn grant(&self, ttl_seconds: i64) -> Result<i64, KvError> {
        let mut state = self.inner.lock().await;
        state.next_lease_id += 1;
        let lease_id = state.next_lease_id;
        state.leases.insert(
            lease_id,
            Lease {
                ttl_seconds,
                deadline: Instant::now() + Duration::from_secs(ttl_seconds.max(0) as u64),
                keys: HashSet::new(),
            },
        );
        Ok(lease_id)
    }

    async fn revoke(&self, lease_id: i64) -> Result<(), KvError> {
        let mut state = self.inner.lock().await;
        if state.remove_lease(&self.events, lease_id) {
            Ok(())
        } else {
            LeaseNotFoundSnafu { lease_id }.fail()
        }
    }

    async fn keep_alive(
        &self,
        cancel: CancellationToken,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>, KvError> {
        let ttl_seconds = {
            let state = self.inner.lock().await;
            match state.leases.get(&lease_id) {
                Some(lease) => lease.ttl_seconds,
                None => return LeaseNotFoundSnafu { lease_id }.fail(),
            }
        };

        let (tx, rx) = mpsc::channel(8);
        let inner = self.inner.clone();
        // Renew at a third of the TTL, the usual keep-alive cadence.
        let step = Duration::from_secs((ttl_seconds.max(3) as u64) / 3);
        tokio::spawn(async move {
            let mut ticker = interval(step);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let renewed = {
                    let mut state = inner.lock().await;
                    match state.leases.get_mut(&lease_id) {
                        Some(lease) => {
                            lease.deadline = Instant::now() + Duration::from_secs(lease.ttl_seconds.max(0) as u64);
                            Some(KeepAliveResponse {
                                lease_id,
                                ttl_seconds: lease.ttl_seconds,
                            })
                        }
                        None => None,
                    }
                };
                match renewed {
                    Some(response) => {
                        if tx.send(response).await.is_err() {
                            return;
                        }
                    }
                    // Lease is gone; closing the channel ends the stream.
                    None => return,
                }
            }
        });
        Ok(rx)
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KvError> {
        let mut state = self.inner.lock().await;
        let succeeded = request.compare.iter().all(|cmp| state.compare(cmp));
        let branch = if succeeded { &request.success } else { &request.failure };
        let results = self.apply_ops(&mut state, branch);
        Ok(TxnResponse {
            header: ResponseHeader {
                revision: state.revision,
            },
            succeeded,
            results,
        })
    }

    async fn get(&self, key: &str) -> Result<RangeResponse, KvError> {
        let state = self.inner.lock().await;
        let kvs = state.keys.get(key).map(|e| vec![e.to_kv(key)]).unwrap_or_default();
        Ok(RangeResponse {
            header: ResponseHeader {
                revision: state.revision,
            },
            kvs,
        })
    }

    async fn get_range(&self, prefix: &str, select: RangeSelect) -> Result<RangeResponse, KvError> {
        let state = self.inner.lock().await;
        let kvs = state.select_range(prefix, select);
        Ok(RangeResponse {
            header: ResponseHeader {
                revision: state.revision,
            },
            kvs,
        })
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        let mut state = self.inner.lock().await;
        state.revision += 1;
        let revision = state.revision;
        let deleted = if state.delete_key(&self.events, key, revision) { 1 } else { 0 };
        Ok(deleted)
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<Result<WatchEvent, KvError>>, KvError> {
        let key = key.to_string();
        let (tx, rx) = mpsc::channel(32);

        // Subscribe under the state lock: every event is logged and sent
        // under the same lock, so the subscription starts exactly where the
        // history snapshot ends.
        let (history, mut live) = {
            let state = self.inner.lock().await;
            let history: Vec<LoggedEvent> = state
                .log
                .iter()
                .filter(|logged| logged.revision >= from_revision && logged.event.kv.key == key)
                .cloned()
                .collect();
            (history, self.events.subscribe())
        };
        let snapshot_head = history.last().map(|logged| logged.revision).unwrap_or(i64::MIN);

        tokio::spawn(async move {
            for logged in history {
                if tx.send(Ok(logged.event)).await.is_err() {
                    return;
                }
            }
            loop {
                let logged = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = live.recv() => match received {
                        Ok(logged) => logged,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let lagged = FailedSnafu {
                                reason: format!("watch lagged behind by {missed} events"),
                            }
                            .build();
                            let _ = tx.send(Err(lagged)).await;
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                if logged.event.kv.key != key || logged.revision <= snapshot_head {
                    continue;
                }
                if logged.revision < from_revision {
                    continue;
                }
                if tx.send(Ok(logged.event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_revision_is_assigned_once() {
        let store = DeterministicKvStore::new();
        store
            .txn(TxnRequest {
                compare: vec![],
                success: vec![TxnOp::Put {
                    key: "a".into(),
                    value: "1".into(),
                    lease: 0,
                }],
                failure: vec![],
            })
            .await
            .unwrap();
        let first = store.get("a").await.unwrap().kvs[0].clone();
        store
            .txn(TxnRequest {
                compare: vec![],
                success: vec![TxnOp::Put {
                    key: "a".into(),
                    value: "2".into(),
                    lease: 0,
                }],
                failure: vec![],
            })
            .await
            .unwrap();
        let second = store.get("a").await.unwrap().kvs[0].clone();
        assert_eq!(first.create_revision, second.create_revision);
        assert!(second.mod_revision > first.mod_revision);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn txn_branches_on_create_revision() {
        let store = DeterministicKvStore::new();
        let response = store
            .txn(TxnRequest {
                compare: vec![Compare::create_revision("k", CompareOp::Equal, 0)],
                success: vec![TxnOp::Put {
                    key: "k".into(),
                    value: "v".into(),
                    lease: 0,
                }],
                failure: vec![TxnOp::Get { key: "k".into() }],
            })
            .await
            .unwrap();
        assert!(response.succeeded);

        let response = store
            .txn(TxnRequest {
                compare: vec![Compare::create_revision("k", CompareOp::Equal, 0)],
                success: vec![],
                failure: vec![TxnOp::Get { key: "k".into() }],
            })
            .await
            .unwrap();
        assert!(!response.succeeded);
        match &response.results[0] {
            TxnOpResult::Get { kvs } => assert_eq!(kvs[0].value, "v"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn range_selectors_pick_order_extremes() {
        let store = DeterministicKvStore::new();
        for key in ["p/1", "p/2", "p/3"] {
            store
                .txn(TxnRequest {
                    compare: vec![],
                    success: vec![TxnOp::Put {
                        key: key.into(),
                        value: "".into(),
                        lease: 0,
                    }],
                    failure: vec![],
                })
                .await
                .unwrap();
        }
        let first = store.get_range("p/", RangeSelect::FirstCreate).await.unwrap();
        assert_eq!(first.kvs[0].key, "p/1");

        let last = store.get_range("p/", RangeSelect::LastCreateMax(i64::MAX)).await.unwrap();
        assert_eq!(last.kvs[0].key, "p/3");

        let second = store
            .get_range("p/", RangeSelect::LastCreateMax(first.kvs[0].create_revision + 1))
            .await
            .unwrap();
        assert_eq!(second.kvs[0].key, "p/2");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_attached_keys() {
        let store = DeterministicKvStore::new();
        let lease = store.grant(2).await.unwrap();
        store
            .txn(TxnRequest {
                compare: vec![],
                success: vec![TxnOp::Put {
                    key: "leased".into(),
                    value: "".into(),
                    lease,
                }],
                failure: vec![],
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let read = store.get("leased").await.unwrap();
        assert!(read.kvs.is_empty(), "key should die with its lease");
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_holds_lease_open() {
        let store = DeterministicKvStore::new();
        let lease = store.grant(2).await.unwrap();
        store
            .txn(TxnRequest {
                compare: vec![],
                success: vec![TxnOp::Put {
                    key: "held".into(),
                    value: "".into(),
                    lease,
                }],
                failure: vec![],
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut stream = store.keep_alive(cancel.clone(), lease).await.unwrap();
        let drain = tokio::spawn(async move { while stream.recv().await.is_some() {} });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get("held").await.unwrap().kvs.len(), 1);

        cancel.cancel();
        drain.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get("held").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn watch_replays_history_from_revision() {
        let store = DeterministicKvStore::new();
        store
            .txn(TxnRequest {
                compare: vec![],
                success: vec![TxnOp::Put {
                    key: "w".into(),
                    value: "".into(),
                    lease: 0,
                }],
                failure: vec![],
            })
            .await
            .unwrap();
        let header_rev = store.get("w").await.unwrap().header.revision;
        store.delete("w").await.unwrap();

        // The delete happened before the watch opened; replay must surface it.
        let mut watch = store
            .watch(CancellationToken::new(), "w", header_rev)
            .await
            .unwrap();
        let event = watch.recv().await.unwrap().unwrap();
        assert_eq!(event.event_type, EventType::Delete);
    }
}
