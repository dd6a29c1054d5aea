//! Quorum composite over independent expiring locks.
//!
//! Acquisition fans out to every member in order and counts a member only
//! when it granted the lock within the per-node budget; holding a majority
//! of healthy members is what makes the composite a lock. This buys
//! tolerance of minority failures, not linearizability.

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClientSnafu;
use crate::error::LockError;
use crate::error::QuorumNotMetSnafu;
use crate::error::TimingBudgetTooTightSnafu;
use crate::error::TooFewNodesSnafu;
use crate::redis::client::Client;
use crate::redis::client::LockClient;
use crate::redis::lock::RedisLock;
use crate::redis::options::LockOptions;
use crate::redis::options::RedLockOptions;
use crate::redis::options::SingleNodeConf;

/// Minimum quorum size.
const MIN_NODES: usize = 3;

/// A Redlock-style quorum of expiring locks.
///
/// Children are visited in construction order; `lock` succeeds when at
/// least ⌊N/2⌋+1 of them granted within the per-node budget. Children
/// acquired on a failed attempt are *not* released automatically; call
/// [`unlock`](RedLock::unlock) afterwards either way.
pub struct RedLock {
    locks: Vec<RedisLock>,
    options: RedLockOptions,
}

impl RedLock {
    /// Build a composite over freshly connected clients, one per node.
    pub async fn new(
        key: impl Into<String>,
        confs: Vec<SingleNodeConf>,
        options: RedLockOptions,
    ) -> Result<Self, LockError> {
        let key = key.into();
        let options = Self::validate(confs.len(), options)?;

        let mut clients: Vec<Arc<dyn LockClient>> = Vec::with_capacity(confs.len());
        for conf in &confs {
            let client = Client::new(&conf.address, &conf.password, conf.options.clone())
                .await
                .context(ClientSnafu)?;
            clients.push(Arc::new(client));
        }
        Ok(Self::assemble(key, clients, options))
    }

    /// Build a composite over already-connected clients. This is how tests
    /// wire in deterministic members.
    pub fn from_clients(
        key: impl Into<String>,
        clients: Vec<Arc<dyn LockClient>>,
        options: RedLockOptions,
    ) -> Result<Self, LockError> {
        let options = Self::validate(clients.len(), options)?;
        Ok(Self::assemble(key.into(), clients, options))
    }

    /// Reject configurations whose acquisition cost could eat a meaningful
    /// share of the lock lifetime.
    fn validate(nodes: usize, options: RedLockOptions) -> Result<RedLockOptions, LockError> {
        if nodes < MIN_NODES {
            return TooFewNodesSnafu { count: nodes }.fail();
        }
        let options = options.repair();
        if let Some(expire_duration) = options.expire_duration {
            if options.single_node_timeout * (nodes as u32) * 10 > expire_duration {
                return TimingBudgetTooTightSnafu {
                    nodes,
                    single_node_timeout: options.single_node_timeout,
                    expire_duration,
                }
                .fail();
            }
        }
        Ok(options)
    }

    fn assemble(key: String, clients: Vec<Arc<dyn LockClient>>, options: RedLockOptions) -> Self {
        let expire_seconds = options
            .expire_duration
            .map(|expire_duration| expire_duration.as_secs())
            .unwrap_or(0);
        let locks = clients
            .into_iter()
            .map(|client| {
                let mut lock_options = LockOptions::new();
                if expire_seconds > 0 {
                    lock_options = lock_options.with_expire_seconds(expire_seconds);
                }
                RedisLock::new(key.clone(), client, lock_options)
            })
            .collect();
        Self { locks, options }
    }

    /// Majority threshold, ⌊N/2⌋+1.
    fn required(&self) -> usize {
        self.locks.len() / 2 + 1
    }

    /// Acquire a majority of members.
    ///
    /// A member counts only when its grant both succeeded and arrived within
    /// the per-node timeout; slow grants are still *held* but not counted.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let mut acquired = 0;
        for lock in &mut self.locks {
            let started = Instant::now();
            let result = lock.lock(cancel).await;
            let cost = started.elapsed();
            match result {
                Ok(()) if cost <= self.options.single_node_timeout => acquired += 1,
                Ok(()) => {
                    debug!(key = %lock.key(), cost_ms = cost.as_millis() as u64, "node granted too slowly, not counted");
                }
                Err(error) => {
                    debug!(key = %lock.key(), error = %error, "node failed to grant");
                }
            }
        }

        let required = self.required();
        if acquired >= required {
            debug!(acquired, required, "quorum acquired");
            Ok(())
        } else {
            QuorumNotMetSnafu { acquired, required }.fail()
        }
    }

    /// Release every member, keeping the first error for the caller.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let mut first_error = None;
        for lock in &mut self.locks {
            if let Err(error) = lock.unlock(cancel).await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Per-node acquisition deadline.
    pub fn single_node_timeout(&self) -> Duration {
        self.options.single_node_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::inmemory::DeterministicLockClient;

    fn members(count: usize) -> Vec<Arc<dyn LockClient>> {
        (0..count)
            .map(|_| DeterministicLockClient::new() as Arc<dyn LockClient>)
            .collect()
    }

    #[test]
    fn fewer_than_three_nodes_rejected() {
        let result = RedLock::from_clients("k", members(2), RedLockOptions::new());
        assert!(matches!(result, Err(LockError::TooFewNodes { count: 2 })));
    }

    #[test]
    fn tight_budget_rejected() {
        // 3 nodes x 50ms x 10 = 1.5s > 1s lifetime.
        let options = RedLockOptions::new()
            .with_single_node_timeout(Duration::from_millis(50))
            .with_expire_duration(Duration::from_secs(1));
        let result = RedLock::from_clients("k", members(3), options);
        assert!(matches!(result, Err(LockError::TimingBudgetTooTight { .. })));
    }

    #[test]
    fn comfortable_budget_accepted() {
        // 3 nodes x 50ms x 10 = 1.5s <= 30s lifetime.
        let options = RedLockOptions::new()
            .with_single_node_timeout(Duration::from_millis(50))
            .with_expire_duration(Duration::from_secs(30));
        assert!(RedLock::from_clients("k", members(3), options).is_ok());
    }

    #[test]
    fn majority_thresholds() {
        let composite = RedLock::from_clients("k", members(5), RedLockOptions::new()).unwrap();
        assert_eq!(composite.required(), 3);
        let composite = RedLock::from_clients("k", members(4), RedLockOptions::new()).unwrap();
        assert_eq!(composite.required(), 3);
    }
}
