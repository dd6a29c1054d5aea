//! Distributed mutual exclusion over remote coordination backends.
//!
//! Two independent lock families live here:
//!
//! - A **fair, strongly-consistent mutex** ([`Mutex`]) over a lease-aware,
//!   watch-capable key-value store ([`kv::KvStore`]). Contenders enqueue
//!   keys tied to a [`Session`] lease; the holder is whoever's key has the
//!   smallest create revision, and waiters block on their direct
//!   predecessor. Crash safety comes from the lease: when a holder stops
//!   renewing, its key and its place in the queue disappear with it.
//! - An **opportunistic expiring lock** ([`redis::RedisLock`]) on a TTL key
//!   server, owned through a fencing token and kept alive by a watchdog,
//!   plus a Redlock-style quorum composite ([`redis::RedLock`]) over N
//!   independent servers.
//!
//! Both families talk to their backends through narrow traits and ship
//! deterministic in-memory implementations
//! ([`kv::DeterministicKvStore`], [`redis::DeterministicLockClient`]) so
//! protocol behavior is testable without infrastructure.
//!
//! # Fair mutex
//!
//! ```ignore
//! use std::sync::Arc;
//! use holdfast::{Mutex, Session, SessionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let session = Arc::new(Session::new(store, SessionOptions::new().with_ttl(30)).await?);
//! let mut mutex = Mutex::new(session, "locks/reports");
//!
//! let scope = CancellationToken::new();
//! mutex.lock(&scope).await?;
//! // …critical section, optionally guarded further with mutex.is_owner()…
//! mutex.unlock(&scope).await?;
//! ```
//!
//! # Expiring lock
//!
//! ```ignore
//! use holdfast::redis::{Client, ClientOptions, LockOptions, RedisLock};
//!
//! let client = Arc::new(Client::new("127.0.0.1:6379", "", ClientOptions::new()).await?);
//! let mut lock = RedisLock::new("jobs/nightly", client, LockOptions::new().with_block());
//!
//! lock.lock(&scope).await?;
//! // …the watchdog renews the TTL until unlock…
//! lock.unlock(&scope).await?;
//! ```

#![warn(missing_docs)]

mod error;
/// Coordination-store contract and backends.
pub mod kv;
mod mutex;
/// Key-server contract, expiring lock, and quorum composite.
pub mod redis;
mod session;
mod wait;

pub use error::LockError;
pub use mutex::Locker;
pub use mutex::Mutex;
pub use session::DEFAULT_SESSION_TTL_SECONDS;
pub use session::Session;
pub use session::SessionOptions;
