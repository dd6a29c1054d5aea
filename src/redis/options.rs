//! Configuration for the key-server client and both lock flavors.
//!
//! Every options struct follows the same pattern: builder-style `with_*`
//! setters over defaults, and a `repair` step that replaces out-of-range
//! values instead of erroring, so a half-configured caller still gets a
//! working lock.

use std::time::Duration;

/// Default number of pooled connections.
pub const DEFAULT_MAX_IDLE: usize = 20;
/// Default per-operation response timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 10;
/// Default bound on concurrently borrowed connections.
pub const DEFAULT_MAX_ACTIVE: usize = 100;
/// Default lock TTL when none is configured.
pub const DEFAULT_LOCK_EXPIRE_SECONDS: u64 = 30;
/// Watchdog renewal cadence.
pub const WATCHDOG_STEP_SECONDS: u64 = 10;
/// Default budget for blocking acquisition.
pub const DEFAULT_BLOCK_WAITING_SECONDS: u64 = 5;
/// Retry cadence while blocking on a held lock.
pub const BLOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Default per-node timeout for the quorum composite.
pub const DEFAULT_SINGLE_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Connection-pool configuration for [`Client`](crate::redis::Client).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) max_idle: usize,
    pub(crate) idle_timeout_seconds: u64,
    pub(crate) max_active: usize,
    pub(crate) wait: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            max_active: DEFAULT_MAX_ACTIVE,
            wait: false,
        }
    }
}

impl ClientOptions {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of multiplexed connections kept in the pool.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Per-operation response timeout.
    pub fn with_idle_timeout_seconds(mut self, idle_timeout_seconds: u64) -> Self {
        self.idle_timeout_seconds = idle_timeout_seconds;
        self
    }

    /// Bound on operations holding a connection at once.
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Wait for a free connection instead of failing fast when the pool is
    /// saturated.
    pub fn with_wait_mode(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Replace zeroed sizes with workable defaults.
    pub(crate) fn repair(mut self) -> Self {
        if self.max_idle == 0 {
            self.max_idle = DEFAULT_MAX_IDLE;
        }
        if self.max_active == 0 {
            self.max_active = DEFAULT_MAX_ACTIVE;
        }
        self
    }
}

/// Behavior of a single [`RedisLock`](crate::redis::RedisLock).
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    pub(crate) block: bool,
    pub(crate) block_waiting_seconds: u64,
    pub(crate) expire_seconds: u64,
    pub(crate) watchdog_mode: bool,
}

impl LockOptions {
    /// Start from the defaults: non-blocking, 30 second TTL with the
    /// watchdog renewing it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry a contended acquisition instead of failing immediately.
    pub fn with_block(mut self) -> Self {
        self.block = true;
        self
    }

    /// Budget for blocking retries.
    pub fn with_block_waiting_seconds(mut self, block_waiting_seconds: u64) -> Self {
        self.block_waiting_seconds = block_waiting_seconds;
        self
    }

    /// Fixed TTL for the lock key. Setting this disables the watchdog: the
    /// lock expires after exactly this long unless re-acquired.
    pub fn with_expire_seconds(mut self, expire_seconds: u64) -> Self {
        self.expire_seconds = expire_seconds;
        self
    }

    /// Fill in the blocking budget and, when no TTL was chosen, fall back to
    /// the default TTL with watchdog renewal enabled.
    pub(crate) fn repair(mut self) -> Self {
        if self.block && self.block_waiting_seconds == 0 {
            self.block_waiting_seconds = DEFAULT_BLOCK_WAITING_SECONDS;
        }
        if self.expire_seconds == 0 {
            self.expire_seconds = DEFAULT_LOCK_EXPIRE_SECONDS;
            self.watchdog_mode = true;
        }
        self
    }
}

/// Behavior of a [`RedLock`](crate::redis::RedLock) quorum composite.
#[derive(Debug, Clone)]
pub struct RedLockOptions {
    pub(crate) single_node_timeout: Duration,
    pub(crate) expire_duration: Option<Duration>,
}

impl Default for RedLockOptions {
    fn default() -> Self {
        Self {
            single_node_timeout: DEFAULT_SINGLE_LOCK_TIMEOUT,
            expire_duration: None,
        }
    }
}

impl RedLockOptions {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-node acquisition budget; slower grants count as failures.
    pub fn with_single_node_timeout(mut self, single_node_timeout: Duration) -> Self {
        self.single_node_timeout = single_node_timeout;
        self
    }

    /// Total lifetime of the composite lock.
    pub fn with_expire_duration(mut self, expire_duration: Duration) -> Self {
        self.expire_duration = Some(expire_duration);
        self
    }

    pub(crate) fn repair(mut self) -> Self {
        if self.single_node_timeout.is_zero() {
            self.single_node_timeout = DEFAULT_SINGLE_LOCK_TIMEOUT;
        }
        self
    }
}

/// Connection parameters for one member of a quorum composite.
#[derive(Debug, Clone)]
pub struct SingleNodeConf {
    /// Server address, e.g. `redis://10.0.0.1:6379`.
    pub address: String,
    /// Password, empty for none.
    pub password: String,
    /// Pool options for this node's client.
    pub options: ClientOptions,
}
