// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! Lock contract shared by every strategy.

use crate::{
    FencingLock, LockError, LockOptions, LockResult, PubSubLock, QueueLock, QuorumLock, SpinLock,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use plexspaces_store::LockStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ulid::Ulid;

/// Mutual-exclusion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Polling with exponential backoff
    Spin,
    /// Release notification plus 10ms poll
    PubSub,
    /// FIFO waiter list with addressed wake-ups
    Queue,
    /// Pub/sub lock plus monotonic fencing token
    Fencing,
    /// Majority agreement over several stores
    Quorum,
}

impl LockStrategy {
    /// Stable name used in logs, metrics and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            LockStrategy::Spin => "spin",
            LockStrategy::PubSub => "pubsub",
            LockStrategy::Queue => "queue",
            LockStrategy::Fencing => "fencing",
            LockStrategy::Quorum => "quorum",
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStrategy {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spin" => Ok(LockStrategy::Spin),
            "pubsub" | "pub-sub" | "pub_sub" => Ok(LockStrategy::PubSub),
            "queue" => Ok(LockStrategy::Queue),
            "fencing" => Ok(LockStrategy::Fencing),
            "quorum" | "redlock" => Ok(LockStrategy::Quorum),
            other => Err(LockError::ConfigError(format!(
                "Unknown lock strategy: {}. Valid options: spin, pubsub, queue, fencing, quorum",
                other
            ))),
        }
    }
}

/// A held lock, handed to the critical section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    /// Lock key
    pub key: String,
    /// Value written to the lock record; required to release
    pub holder_token: String,
    /// Fencing token (fencing strategy only)
    pub fencing_token: Option<i64>,
    /// Acquisition time
    pub acquired_at: DateTime<Utc>,
    /// Lease duration requested
    pub ttl: Duration,
    /// Strategy that produced the lease
    pub strategy: LockStrategy,
}

impl LockLease {
    pub(crate) fn new(key: &str, holder_token: String, ttl: Duration, strategy: LockStrategy) -> Self {
        Self {
            key: key.to_string(),
            holder_token,
            fencing_token: None,
            acquired_at: Utc::now(),
            ttl,
            strategy,
        }
    }
}

/// Unique token for one acquisition attempt: process id, timestamp and a
/// random ULID.
pub fn new_holder_token() -> String {
    format!("{}-{}-{}", std::process::id(), Utc::now().timestamp_millis(), Ulid::new())
}

pub(crate) fn record_acquired(strategy: LockStrategy, attempts: u32) {
    metrics::counter!("plexspaces_lock_acquired_total", "strategy" => strategy.as_str()).increment(1);
    metrics::counter!("plexspaces_lock_attempts_total", "strategy" => strategy.as_str())
        .increment(u64::from(attempts));
}

pub(crate) fn timeout_error(strategy: LockStrategy, key: &str, attempts: u32, started: tokio::time::Instant) -> LockError {
    metrics::counter!("plexspaces_lock_timeouts_total", "strategy" => strategy.as_str()).increment(1);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    debug!(lock_key = %key, strategy = %strategy, attempts, elapsed_ms, "lock acquisition timed out");
    LockError::Timeout {
        key: key.to_string(),
        attempts,
        elapsed_ms,
    }
}

/// A distributed mutual-exclusion strategy.
///
/// ## Design
/// - **One type per strategy**, chosen explicitly by the caller
/// - **Token-checked release**: a holder only deletes its own record, so a
///   lease that expired and was re-acquired elsewhere is never released by
///   the stale holder
/// - **Not reentrant**: acquiring a key the caller already holds waits like
///   any other caller
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key`, waiting up to `options.timeout`.
    ///
    /// ## Returns
    /// - `Ok(LockLease)`: lock held
    /// - `Err(LockError::Timeout)`: not obtained within the bounds
    /// - `Err(LockError::FencingTokenViolation)`: fencing check failed after acquisition
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease>;

    /// Release a lease. `Ok(false)` means the record had already expired or
    /// belongs to someone else.
    async fn release(&self, lease: &LockLease) -> LockResult<bool>;

    /// Strategy implemented by this lock.
    fn strategy(&self) -> LockStrategy;

    /// Owned handle to this lock, used to release a lease after the future
    /// that held it was dropped.
    fn handle(&self) -> Arc<dyn DistributedLock>;
}

/// Run an operation while holding a lock.
#[async_trait]
pub trait WithLock: DistributedLock {
    /// Acquire `key`, run `operation` exactly once with the lease, then
    /// release on every exit path (including panics, which are resumed after
    /// release). A failed acquisition never runs the operation.
    ///
    /// Release failures are logged; the operation's result is returned.
    /// If the returned future is dropped while the operation runs (for
    /// example under `tokio::time::timeout`), the release is spawned onto the
    /// current runtime; outside a runtime the lease is left to expire.
    ///
    /// ## Examples
    /// ```rust
    /// use plexspaces_locks::{LockError, LockOptions, SpinLock, WithLock};
    /// use plexspaces_store::InMemoryStore;
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> Result<(), LockError> {
    /// let lock = SpinLock::new(Arc::new(InMemoryStore::new()));
    /// let total = lock
    ///     .with_lock("inventory:sku-1", &LockOptions::default(), |_lease| async move {
    ///         Ok::<_, LockError>(41 + 1)
    ///     })
    ///     .await?;
    /// assert_eq!(total, 42);
    /// # Ok(())
    /// # }
    /// ```
    async fn with_lock<T, E, F, Fut>(&self, key: &str, options: &LockOptions, operation: F) -> Result<T, E>
    where
        F: FnOnce(LockLease) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<LockError> + Send,
    {
        let lease = self.acquire(key, options).await.map_err(E::from)?;
        let mut guard = ReleaseOnDrop::new(self.handle(), lease.clone());
        let outcome = AssertUnwindSafe(operation(lease.clone())).catch_unwind().await;
        guard.disarm();

        match self.release(&lease).await {
            Ok(true) => debug!(lock_key = %key, strategy = %lease.strategy, "lock released"),
            Ok(false) => warn!(lock_key = %key, holder = %lease.holder_token, "lock expired before release"),
            Err(e) => warn!(lock_key = %key, holder = %lease.holder_token, error = %e, "failed to release lock"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl<L: DistributedLock + ?Sized> WithLock for L {}

/// Releases a lease from a spawned task when dropped while still armed.
struct ReleaseOnDrop {
    lock: Option<Arc<dyn DistributedLock>>,
    lease: LockLease,
}

impl ReleaseOnDrop {
    fn new(lock: Arc<dyn DistributedLock>, lease: LockLease) -> Self {
        Self { lock: Some(lock), lease }
    }

    fn disarm(&mut self) {
        self.lock = None;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.lease.key, "no runtime to release abandoned lease; left to expire");
            return;
        };
        let lease = self.lease.clone();
        runtime.spawn(async move {
            match lock.release(&lease).await {
                Ok(released) => debug!(lock_key = %lease.key, released, "abandoned lease released"),
                Err(e) => warn!(lock_key = %lease.key, error = %e, "failed to release abandoned lease"),
            }
        });
    }
}

/// Build a lock of the given strategy over a single store.
///
/// A quorum lock over one store degenerates to single-instance locking.
pub fn build_lock(strategy: LockStrategy, store: Arc<dyn LockStore>) -> Arc<dyn DistributedLock> {
    match strategy {
        LockStrategy::Spin => Arc::new(SpinLock::new(store)),
        LockStrategy::PubSub => Arc::new(PubSubLock::new(store)),
        LockStrategy::Queue => Arc::new(QueueLock::new(store)),
        LockStrategy::Fencing => Arc::new(FencingLock::new(store)),
        LockStrategy::Quorum => Arc::new(QuorumLock::new(vec![store])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexspaces_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_strategy_round_trip_names() {
        for strategy in [
            LockStrategy::Spin,
            LockStrategy::PubSub,
            LockStrategy::Queue,
            LockStrategy::Fencing,
            LockStrategy::Quorum,
        ] {
            assert_eq!(strategy.as_str().parse::<LockStrategy>().unwrap(), strategy);
        }
        assert_eq!("Redlock".parse::<LockStrategy>().unwrap(), LockStrategy::Quorum);
        assert!("mutex".parse::<LockStrategy>().is_err());
    }

    #[test]
    fn test_holder_tokens_are_unique() {
        let a = new_holder_token();
        let b = new_holder_token();
        assert_ne!(a, b);
        assert!(a.starts_with(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_build_lock_selects_strategy() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        for strategy in [
            LockStrategy::Spin,
            LockStrategy::PubSub,
            LockStrategy::Queue,
            LockStrategy::Fencing,
            LockStrategy::Quorum,
        ] {
            let lock = build_lock(strategy, store.clone());
            assert_eq!(lock.strategy(), strategy);

            let lease = lock.acquire("build:key", &LockOptions::default()).await.unwrap();
            assert_eq!(lease.strategy, strategy);
            assert!(lock.release(&lease).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_with_lock_propagates_error_and_releases() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        let lock = SpinLock::new(store.clone());
        let calls = AtomicUsize::new(0);

        let result: Result<(), LockError> = lock
            .with_lock("err:key", &LockOptions::default(), |_lease| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LockError::InvalidKey("from operation".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(LockError::InvalidKey(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.exists("err:key").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_timeout_skips_operation() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        store.set_px("busy:key", "someone-else", Duration::from_secs(5)).await.unwrap();
        let lock = SpinLock::new(store.clone());
        let options = LockOptions::default()
            .with_timeout(Duration::from_millis(50))
            .with_max_attempts(3);
        let calls = AtomicUsize::new(0);

        let result: Result<(), LockError> = lock
            .with_lock("busy:key", &options, |_lease| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get("busy:key").await.unwrap().as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        let lock = Arc::new(SpinLock::new(store.clone()));

        let task_lock = lock.clone();
        let joined = tokio::spawn(async move {
            task_lock
                .with_lock("panic:key", &LockOptions::default(), |_lease| async {
                    if true {
                        panic!("critical section failed");
                    }
                    Ok::<(), LockError>(())
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!store.exists("panic:key").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_cancelled_caller_releases() {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        let lock = build_lock(LockStrategy::PubSub, store.clone());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            lock.with_lock("cancel:key", &LockOptions::default(), |_lease| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), LockError>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let mut released = false;
        for _ in 0..100 {
            if !store.exists("cancel:key").await.unwrap() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(released, "lease outlived the cancelled caller");

        let quick = LockOptions::default().with_max_attempts(1);
        let lease = lock.acquire("cancel:key", &quick).await.unwrap();
        assert!(lock.release(&lease).await.unwrap());
    }
}
