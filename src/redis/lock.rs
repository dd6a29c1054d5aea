//! Expiring single-key lock with fencing token and watchdog renewal.
//!
//! Ownership is the pair (key, token): the key holds our token with a TTL,
//! and release or renewal only touch the key after atomically re-checking
//! the token. A stalled holder therefore cannot delete or extend a lock
//! that has since been taken by someone else.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::BlockingTimeoutSnafu;
use crate::error::CancelledSnafu;
use crate::error::LockError;
use crate::error::LockNotHeldSnafu;
use crate::error::NotOwnerSnafu;
use crate::redis::client::LockClient;
use crate::redis::options::BLOCK_RETRY_INTERVAL;
use crate::redis::options::LockOptions;
use crate::redis::options::WATCHDOG_STEP_SECONDS;

/// Atomic check-and-delete: remove the key only while it still carries our
/// token.
pub(crate) const UNLOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Atomic check-and-renew: extend the TTL only while the key still carries
/// our token.
pub(crate) const RENEW_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('expire', KEYS[1], ARGV[2]) else return 0 end";

struct Watchdog {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An expiring lock on a single key.
///
/// One handle serves one caller; operations take `&mut self`. Each handle
/// carries a process-unique fencing token, so two handles on the same key
/// contend like separate owners even inside one process.
pub struct RedisLock {
    key: String,
    token: String,
    options: LockOptions,
    client: Arc<dyn LockClient>,
    watchdog: Option<Watchdog>,
}

impl RedisLock {
    /// Create a lock handle for `key`.
    ///
    /// Without an explicit TTL in `options`, the lock defaults to 30 seconds
    /// and the watchdog renews it for as long as the handle stays locked.
    pub fn new(key: impl Into<String>, client: Arc<dyn LockClient>, options: LockOptions) -> Self {
        Self {
            key: key.into(),
            token: format!("{}_{}", std::process::id(), Uuid::new_v4()),
            options: options.repair(),
            client,
            watchdog: None,
        }
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The fencing token this handle writes into the key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Acquire the lock.
    ///
    /// Non-blocking mode fails with [`LockError::LockNotHeld`] when the key
    /// is taken. Blocking mode retries every 50ms until the key frees up,
    /// the waiting budget elapses ([`LockError::BlockingTimeout`]), or the
    /// scope is cancelled.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        let started = Instant::now();

        match self.attempt(cancel).await? {
            true => {
                self.on_acquired();
                return Ok(());
            }
            false if !self.options.block => return LockNotHeldSnafu.fail(),
            false => {}
        }

        let deadline = started + Duration::from_secs(self.options.block_waiting_seconds);
        let mut ticker = interval(BLOCK_RETRY_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return CancelledSnafu.fail(),
                _ = tokio::time::sleep_until(deadline) => {
                    return BlockingTimeoutSnafu {
                        waited_ms: started.elapsed().as_millis() as u64,
                    }
                    .fail();
                }
                _ = ticker.tick() => {}
            }
            if self.attempt(cancel).await? {
                self.on_acquired();
                return Ok(());
            }
        }
    }

    /// One conditional set; true when we took the key.
    async fn attempt(&self, cancel: &CancellationToken) -> Result<bool, LockError> {
        let set = self.client.set_nex(&self.key, &self.token, self.options.expire_seconds);
        tokio::select! {
            _ = cancel.cancelled() => CancelledSnafu.fail(),
            result = set => match result {
                Ok(1) => Ok(true),
                Ok(_) => Ok(false),
                Err(source) => Err(LockError::Client { source }),
            },
        }
    }

    fn on_acquired(&mut self) {
        debug!(key = %self.key, token = %self.token, expire_seconds = self.options.expire_seconds, "lock acquired");
        if self.options.watchdog_mode {
            self.start_watchdog();
        }
    }

    /// Release the lock.
    ///
    /// The watchdog is stopped first regardless of the outcome. Fails with
    /// [`LockError::NotOwner`] when the key no longer carries our token,
    /// meaning the lock expired or was taken by someone else.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        self.stop_watchdog().await;

        let eval = self.client.eval(
            UNLOCK_SCRIPT,
            std::slice::from_ref(&self.key),
            std::slice::from_ref(&self.token),
        );
        let result = tokio::select! {
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
            result = eval => result,
        };
        match result {
            Ok(1) => {
                debug!(key = %self.key, "lock released");
                Ok(())
            }
            Ok(_) => NotOwnerSnafu.fail(),
            Err(source) => Err(LockError::Client { source }),
        }
    }

    /// Exactly one watchdog runs per held lock.
    fn start_watchdog(&mut self) {
        if let Some(previous) = self.watchdog.take() {
            previous.cancel.cancel();
            previous.task.abort();
        }

        let cancel = CancellationToken::new();
        let client = self.client.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        let expire_seconds = self.options.expire_seconds;
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(WATCHDOG_STEP_SECONDS));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let renew_args = [token.clone(), expire_seconds.to_string()];
                let renew = client.eval(
                    RENEW_SCRIPT,
                    std::slice::from_ref(&key),
                    &renew_args,
                );
                let result = tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    result = renew => result,
                };
                // Renewal failures are never surfaced; the lock just
                // expires on its own schedule.
                match result {
                    Ok(1) => debug!(key = %key, "watchdog renewed lock"),
                    Ok(_) => {
                        warn!(key = %key, "watchdog found foreign or missing token, stopping");
                        return;
                    }
                    Err(error) => debug!(key = %key, error = %error, "watchdog renewal attempt failed"),
                }
            }
        });

        self.watchdog = Some(Watchdog { cancel, task });
    }

    async fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel.cancel();
            let _ = watchdog.task.await;
        }
    }
}

impl Drop for RedisLock {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::inmemory::DeterministicLockClient;

    #[tokio::test]
    async fn tokens_are_unique_per_handle() {
        let client = DeterministicLockClient::new();
        let a = RedisLock::new("k", client.clone(), LockOptions::new());
        let b = RedisLock::new("k", client, LockOptions::new());
        assert_ne!(a.token(), b.token());
        assert!(a.token().starts_with(&format!("{}_", std::process::id())));
    }

    #[tokio::test]
    async fn lock_writes_token_with_ttl() {
        let client = DeterministicLockClient::new();
        let mut lock = RedisLock::new("job", client.clone(), LockOptions::new().with_expire_seconds(7));
        lock.lock(&CancellationToken::new()).await.unwrap();

        assert_eq!(client.value_of("job").await.as_deref(), Some(lock.token()));
        assert!(client.ttl_of("job").await.is_some());
    }

    #[tokio::test]
    async fn unlock_of_unheld_lock_is_not_owner() {
        let client = DeterministicLockClient::new();
        let mut lock = RedisLock::new("job", client, LockOptions::new().with_expire_seconds(7));
        let result = lock.unlock(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LockError::NotOwner)));
    }

    #[tokio::test]
    async fn non_blocking_contention_is_not_held() {
        let client = DeterministicLockClient::new();
        let mut holder = RedisLock::new("job", client.clone(), LockOptions::new().with_expire_seconds(30));
        holder.lock(&CancellationToken::new()).await.unwrap();

        let mut contender = RedisLock::new("job", client, LockOptions::new().with_expire_seconds(30));
        let result = contender.lock(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LockError::LockNotHeld)));
    }
}
