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

//! Spin lock: SET-if-absent polling with exponential backoff.

use crate::manager::{new_holder_token, record_acquired, timeout_error};
use crate::options::Backoff;
use crate::{DistributedLock, LockKeys, LockLease, LockOptions, LockResult, LockStrategy};
use async_trait::async_trait;
use plexspaces_store::{AtomicScripts, LockStore};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Polling lock.
///
/// Each attempt is a single `SET key token NX PX ttl`. Between attempts the
/// caller sleeps according to [`Backoff`]; the wait ends at `max_attempts`
/// or `timeout`, whichever comes first. Cost scales with contention time,
/// so it suits short critical sections.
#[derive(Clone)]
pub struct SpinLock {
    store: Arc<dyn LockStore>,
}

impl SpinLock {
    /// Create a spin lock over `store`.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DistributedLock for SpinLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease> {
        let keys = LockKeys::new(key)?;
        let token = new_holder_token();
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut backoff = Backoff::new(options);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
                record_acquired(LockStrategy::Spin, attempts);
                trace!(lock_key = %key, holder = %token, attempts, "spin lock acquired");
                return Ok(LockLease::new(key, token, options.ttl, LockStrategy::Spin));
            }

            let now = Instant::now();
            if attempts >= options.max_attempts || now >= deadline {
                return Err(timeout_error(LockStrategy::Spin, key, attempts, started));
            }
            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> LockResult<bool> {
        let released = self.store.compare_and_delete(&lease.key, &lease.holder_token).await?;
        if !released {
            warn!(lock_key = %lease.key, holder = %lease.holder_token, "spin lock no longer held at release");
        }
        Ok(released)
    }

    fn strategy(&self) -> LockStrategy {
        LockStrategy::Spin
    }

    fn handle(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockError, WithLock};
    use plexspaces_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn lock() -> (Arc<dyn LockStore>, SpinLock) {
        let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
        (store.clone(), SpinLock::new(store))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (store, lock) = lock();
        let lease = lock.acquire("spin:a", &LockOptions::default()).await.unwrap();
        assert_eq!(store.get("spin:a").await.unwrap(), Some(lease.holder_token.clone()));

        assert!(lock.release(&lease).await.unwrap());
        assert!(!store.exists("spin:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_stops_at_max_attempts() {
        let (store, lock) = lock();
        store.set_px("spin:b", "other", Duration::from_secs(5)).await.unwrap();
        let options = LockOptions::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_timeout(Duration::from_secs(5));

        match lock.acquire("spin:b", &options).await {
            Err(LockError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stops_at_timeout() {
        let (store, lock) = lock();
        store.set_px("spin:c", "other", Duration::from_secs(5)).await.unwrap();
        let options = LockOptions::default()
            .with_max_attempts(10_000)
            .with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        assert!(matches!(lock.acquire("spin:c", &options).await, Err(LockError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acquires_after_holder_expires() {
        let (store, lock) = lock();
        store.set_px("spin:d", "crashed", Duration::from_millis(50)).await.unwrap();

        let lease = lock.acquire("spin:d", &LockOptions::default()).await.unwrap();
        assert_ne!(lease.holder_token, "crashed");
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let (store, lock) = lock();
        let options = LockOptions::default().with_ttl(Duration::from_millis(30));
        let stale = lock.acquire("spin:e", &options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let fresh = lock.acquire("spin:e", &LockOptions::default()).await.unwrap();
        assert!(!lock.release(&stale).await.unwrap());
        assert_eq!(store.get("spin:e").await.unwrap(), Some(fresh.holder_token));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (_store, lock) = lock();
        let lock = Arc::new(lock);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let options = LockOptions::default()
            .with_max_attempts(1_000)
            .with_max_delay(Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            let options = options.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("spin:shared", &options, |_lease| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), LockError>(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
