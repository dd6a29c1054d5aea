//! Typed client for the TTL key server.
//!
//! [`LockClient`] is the narrow contract the expiring lock needs:
//! conditional set with TTL, atomic scripted evaluation, and a few
//! auxiliaries. [`Client`] implements it over a pool of multiplexed
//! connections from the `redis` crate.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::aio::ConnectionManagerConfig;
use snafu::OptionExt;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;

use crate::redis::options::ClientOptions;

/// Failure from the key-server client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    /// A key or value argument was empty.
    #[snafu(display("{operation}: key and value must be non-empty"))]
    EmptyArgument {
        /// The rejecting operation.
        operation: &'static str,
    },

    /// All connections are busy and the client is not in wait mode.
    #[snafu(display("connection pool exhausted"))]
    PoolExhausted,

    /// The server or transport failed.
    #[snafu(display("key server error"))]
    Backend {
        /// The underlying driver error.
        source: redis::RedisError,
    },

    /// Anything else, including in-memory test backends.
    #[snafu(display("key server operation failed: {reason}"))]
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

/// The key-server operations the lock family consumes.
///
/// `set_nex` is `SET key value EX seconds NX` returning 1 when the key was
/// newly set and 0 when it already existed. `eval` runs a script atomically
/// and returns its integer result; lock scripts only ever produce integers,
/// and errors are never encoded in the return value.
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Conditional set with TTL; 1 on a fresh set, 0 when the key exists.
    async fn set_nex(&self, key: &str, value: &str, expire_seconds: u64) -> Result<i64, ClientError>;

    /// Conditional set without TTL; 1 on a fresh set, 0 when the key exists.
    async fn set_nx(&self, key: &str, value: &str) -> Result<i64, ClientError>;

    /// Atomically evaluate a script over `keys` and `args`.
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64, ClientError>;

    /// Read a key; `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>, ClientError>;

    /// Unconditional set.
    async fn set(&self, key: &str, value: &str) -> Result<(), ClientError>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<(), ClientError>;

    /// Increment a counter key, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64, ClientError>;
}

/// Pooled key-server client.
///
/// Holds `max_idle` multiplexed connections borrowed round-robin; at most
/// `max_active` operations hold one at a time. In wait mode a saturated
/// pool queues the borrower, otherwise the operation fails fast with
/// [`ClientError::PoolExhausted`]. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Client {
    options: ClientOptions,
    managers: Arc<Vec<ConnectionManager>>,
    next: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl Client {
    /// Connect to `address` (host:port or a full `redis://` URL), with an
    /// optional password.
    pub async fn new(address: &str, password: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let options = options.repair();
        let url = if address.contains("://") {
            address.to_string()
        } else if password.is_empty() {
            format!("redis://{address}")
        } else {
            format!("redis://:{password}@{address}")
        };

        let client = redis::Client::open(url).context(BackendSnafu)?;
        let config = ConnectionManagerConfig::new()
            .set_response_timeout(Duration::from_secs(options.idle_timeout_seconds))
            .set_connection_timeout(Duration::from_secs(options.idle_timeout_seconds));

        let mut managers = Vec::with_capacity(options.max_idle);
        for _ in 0..options.max_idle {
            let manager = ConnectionManager::new_with_config(client.clone(), config.clone())
                .await
                .context(BackendSnafu)?;
            managers.push(manager);
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(options.max_active)),
            managers: Arc::new(managers),
            next: Arc::new(AtomicUsize::new(0)),
            options,
        })
    }

    /// The repaired options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Borrow a connection; the permit returns it to the pool on drop.
    async fn borrow(&self) -> Result<(ConnectionManager, OwnedSemaphorePermit), ClientError> {
        let permit = if self.options.wait {
            self.permits.clone().acquire_owned().await.ok().context(FailedSnafu {
                reason: "connection pool closed",
            })?
        } else {
            self.permits
                .clone()
                .try_acquire_owned()
                .ok()
                .context(PoolExhaustedSnafu)?
        };
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.managers.len();
        Ok((self.managers[index].clone(), permit))
    }
}

fn require(operation: &'static str, parts: &[&str]) -> Result<(), ClientError> {
    if parts.iter().any(|part| part.is_empty()) {
        return EmptyArgumentSnafu { operation }.fail();
    }
    Ok(())
}

#[async_trait]
impl LockClient for Client {
    async fn set_nex(&self, key: &str, value: &str, expire_seconds: u64) -> Result<i64, ClientError> {
        require("SET EX NX", &[key, value])?;
        let (mut conn, _permit) = self.borrow().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expire_seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context(BackendSnafu)?;
        Ok(if reply.is_some() { 1 } else { 0 })
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<i64, ClientError> {
        require("SET NX", &[key, value])?;
        let (mut conn, _permit) = self.borrow().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context(BackendSnafu)?;
        Ok(if reply.is_some() { 1 } else { 0 })
    }

    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64, ClientError> {
        let (mut conn, _permit) = self.borrow().await?;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        cmd.query_async(&mut conn).await.context(BackendSnafu)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        require("GET", &[key])?;
        let (mut conn, _permit) = self.borrow().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await.context(BackendSnafu)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        require("SET", &[key, value])?;
        let (mut conn, _permit) = self.borrow().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .context(BackendSnafu)
    }

    async fn del(&self, key: &str) -> Result<(), ClientError> {
        require("DEL", &[key])?;
        let (mut conn, _permit) = self.borrow().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .context(BackendSnafu)
    }

    async fn incr(&self, key: &str) -> Result<i64, ClientError> {
        require("INCR", &[key])?;
        let (mut conn, _permit) = self.borrow().await?;
        redis::cmd("INCR").arg(key).query_async(&mut conn).await.context(BackendSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_arguments_are_rejected_before_the_network() {
        assert!(matches!(
            require("SET EX NX", &["", "v"]),
            Err(ClientError::EmptyArgument { .. })
        ));
        assert!(matches!(
            require("SET EX NX", &["k", ""]),
            Err(ClientError::EmptyArgument { .. })
        ));
        assert!(require("SET EX NX", &["k", "v"]).is_ok());
    }

    #[test]
    fn pool_exhausted_display() {
        assert_eq!(ClientError::PoolExhausted.to_string(), "connection pool exhausted");
    }
}
