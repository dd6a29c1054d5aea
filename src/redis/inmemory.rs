//! In-memory deterministic implementation of [`LockClient`] for testing.
//!
//! Behaves like a single TTL key server on the tokio clock: keys expire at
//! deadlines, the two lock scripts evaluate atomically, and tests can inject
//! per-client latency or hard failure to model slow and dead quorum members.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::OptionExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::redis::client::ClientError;
use crate::redis::client::FailedSnafu;
use crate::redis::client::LockClient;
use crate::redis::lock::RENEW_SCRIPT;
use crate::redis::lock::UNLOCK_SCRIPT;

#[derive(Debug, Clone)]
struct Stored {
    value: String,
    deadline: Option<Instant>,
}

impl Stored {
    fn live(&self, now: Instant) -> bool {
        self.deadline.map(|deadline| deadline > now).unwrap_or(true)
    }
}

/// In-memory deterministic TTL key server.
pub struct DeterministicLockClient {
    keys: Mutex<HashMap<String, Stored>>,
    latency: Option<Duration>,
    failing: bool,
}

impl DeterministicLockClient {
    /// A healthy server that answers immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(HashMap::new()),
            latency: None,
            failing: false,
        })
    }

    /// A healthy server that answers after `latency` on every operation.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(HashMap::new()),
            latency: Some(latency),
            failing: false,
        })
    }

    /// A server that fails every operation.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(HashMap::new()),
            latency: None,
            failing: true,
        })
    }

    async fn gate(&self) -> Result<(), ClientError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing {
            return FailedSnafu {
                reason: "injected failure",
            }
            .fail();
        }
        Ok(())
    }

    /// Current value of a key, if it exists and has not expired. Test hook.
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        keys.get(key).filter(|stored| stored.live(now)).map(|stored| stored.value.clone())
    }

    /// Remaining TTL of a key, if it exists and carries one. Test hook.
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        keys.get(key)
            .filter(|stored| stored.live(now))
            .and_then(|stored| stored.deadline)
            .map(|deadline| deadline - now)
    }
}

fn drop_if_expired(keys: &mut HashMap<String, Stored>, key: &str, now: Instant) {
    if let Some(stored) = keys.get(key) {
        if !stored.live(now) {
            keys.remove(key);
        }
    }
}

#[async_trait]
impl LockClient for DeterministicLockClient {
    async fn set_nex(&self, key: &str, value: &str, expire_seconds: u64) -> Result<i64, ClientError> {
        self.gate().await?;
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        drop_if_expired(&mut keys, key, now);
        if keys.contains_key(key) {
            return Ok(0);
        }
        keys.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                deadline: Some(now + Duration::from_secs(expire_seconds)),
            },
        );
        Ok(1)
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<i64, ClientError> {
        self.gate().await?;
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        drop_if_expired(&mut keys, key, now);
        if keys.contains_key(key) {
            return Ok(0);
        }
        keys.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                deadline: None,
            },
        );
        Ok(1)
    }

    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64, ClientError> {
        self.gate().await?;
        let key = keys.first().context(FailedSnafu {
            reason: "eval without a key",
        })?;
        let now = Instant::now();
        let mut stored = self.keys.lock().await;
        drop_if_expired(&mut stored, key, now);

        if script == UNLOCK_SCRIPT {
            let token = args.first().context(FailedSnafu {
                reason: "unlock script without a token",
            })?;
            match stored.get(key) {
                Some(current) if &current.value == token => {
                    stored.remove(key);
                    Ok(1)
                }
                _ => Ok(0),
            }
        } else if script == RENEW_SCRIPT {
            let token = args.first().context(FailedSnafu {
                reason: "renew script without a token",
            })?;
            let expire_seconds: u64 = args
                .get(1)
                .and_then(|raw| raw.parse().ok())
                .context(FailedSnafu {
                    reason: "renew script without an expiry",
                })?;
            match stored.get_mut(key) {
                Some(current) if &current.value == token => {
                    current.deadline = Some(now + Duration::from_secs(expire_seconds));
                    Ok(1)
                }
                _ => Ok(0),
            }
        } else {
            FailedSnafu {
                reason: "unsupported script",
            }
            .fail()
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        self.gate().await?;
        Ok(self.value_of(key).await)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.gate().await?;
        let mut keys = self.keys.lock().await;
        keys.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                deadline: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), ClientError> {
        self.gate().await?;
        let mut keys = self.keys.lock().await;
        keys.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, ClientError> {
        self.gate().await?;
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        drop_if_expired(&mut keys, key, now);
        let next = match keys.get(key) {
            Some(stored) => stored.value.parse::<i64>().ok().context(FailedSnafu {
                reason: "value is not an integer",
            })? + 1,
            None => 1,
        };
        let deadline = keys.get(key).and_then(|stored| stored.deadline);
        keys.insert(
            key.to_string(),
            Stored {
                value: next.to_string(),
                deadline,
            },
        );
        Ok(next)
    }
}
