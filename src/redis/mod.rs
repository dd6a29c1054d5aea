//! The key-server side: client contract, expiring lock, and the quorum
//! composite.

mod client;
pub mod inmemory;
mod lock;
mod options;
mod redlock;

pub use client::Client;
pub use client::ClientError;
pub use client::LockClient;
pub use inmemory::DeterministicLockClient;
pub use lock::RedisLock;
pub use options::BLOCK_RETRY_INTERVAL;
pub use options::ClientOptions;
pub use options::DEFAULT_BLOCK_WAITING_SECONDS;
pub use options::DEFAULT_LOCK_EXPIRE_SECONDS;
pub use options::DEFAULT_SINGLE_LOCK_TIMEOUT;
pub use options::LockOptions;
pub use options::RedLockOptions;
pub use options::SingleNodeConf;
pub use options::WATCHDOG_STEP_SECONDS;
pub use redlock::RedLock;
