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

//! Pub/sub lock: immediate attempt, then wait for a release notification
//! with a short poll as a safety net against lost messages.

use crate::keys::RELEASED_MESSAGE;
use crate::manager::{new_holder_token, record_acquired, timeout_error};
use crate::{DistributedLock, LockKeys, LockLease, LockOptions, LockResult, LockStrategy};
use async_trait::async_trait;
use futures::StreamExt;
use plexspaces_store::{AtomicScripts, LockStore, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Default period of the safety-net poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Notification-driven lock.
///
/// ## Acquisition
/// 1. Try `SET NX PX` immediately
/// 2. Subscribe to `K:channel`, then retry once (a release may have landed
///    between the first attempt and the subscription)
/// 3. Race the channel, a poll of `EXISTS K` and the deadline; on a
///    `released` message or an absent key, retry
///
/// ## Release
/// One atomic script verifies the token, deletes the key and publishes
/// `released`, so a waiter never misses the signal for a delete it observed.
#[derive(Clone)]
pub struct PubSubLock {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
}

impl PubSubLock {
    /// Create a pub/sub lock over `store`.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the safety-net poll period.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Acquire with a caller-chosen holder token.
    pub(crate) async fn acquire_with_token(&self, key: &str, token: String, options: &LockOptions) -> LockResult<LockLease> {
        let keys = LockKeys::new(key)?;
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut attempts = 1u32;

        if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
            record_acquired(LockStrategy::PubSub, attempts);
            return Ok(LockLease::new(key, token, options.ttl, LockStrategy::PubSub));
        }

        let mut subscription = self.store.subscribe(&keys.channel).await?;
        loop {
            if attempts >= options.max_attempts || Instant::now() >= deadline {
                return Err(timeout_error(LockStrategy::PubSub, key, attempts, started));
            }
            attempts += 1;
            if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
                record_acquired(LockStrategy::PubSub, attempts);
                trace!(lock_key = %key, holder = %token, attempts, "pubsub lock acquired");
                return Ok(LockLease::new(key, token, options.ttl, LockStrategy::PubSub));
            }
            if !self.wait_for_release(&mut subscription, &keys.lock, deadline).await? {
                return Err(timeout_error(LockStrategy::PubSub, key, attempts, started));
            }
        }
    }

    /// Wait until a release is signalled or the key disappears. `false` at
    /// the deadline.
    async fn wait_for_release(&self, subscription: &mut Subscription, key: &str, deadline: Instant) -> LockResult<bool> {
        let mut poll = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
                message = subscription.next() => match message {
                    Some(message) if message == RELEASED_MESSAGE => {
                        trace!(lock_key = %key, "release notification received");
                        return Ok(true);
                    }
                    Some(other) => debug!(lock_key = %key, message = %other, "ignoring channel message"),
                    None => {
                        warn!(lock_key = %key, "release subscription closed, falling back to polling");
                        *subscription = futures::stream::pending::<String>().boxed();
                    }
                },
                _ = poll.tick() => {
                    if !self.store.exists(key).await? {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DistributedLock for PubSubLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease> {
        self.acquire_with_token(key, new_holder_token(), options).await
    }

    async fn release(&self, lease: &LockLease) -> LockResult<bool> {
        let keys = LockKeys::new(&lease.key)?;
        let released = self
            .store
            .release_and_publish(&keys.lock, &lease.holder_token, &keys.channel, RELEASED_MESSAGE)
            .await?;
        if !released {
            warn!(lock_key = %lease.key, holder = %lease.holder_token, "pubsub lock no longer held at release");
        }
        Ok(released)
    }

    fn strategy(&self) -> LockStrategy {
        LockStrategy::PubSub
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

    fn store() -> Arc<dyn LockStore> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release_notification() {
        let store = store();
        // Poll far slower than the test so only the notification can wake the waiter
        let lock = PubSubLock::new(store.clone()).with_poll_interval(Duration::from_secs(60));
        let holder = lock.acquire("ps:a", &LockOptions::default()).await.unwrap();

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let lease = waiter_lock.acquire("ps:a", &LockOptions::default()).await.unwrap();
            (lease, started.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lock.release(&holder).await.unwrap());

        let (lease, waited) = waiter.await.unwrap();
        assert_eq!(lease.strategy, LockStrategy::PubSub);
        assert!(waited < Duration::from_secs(5));
        assert_eq!(store.get("ps:a").await.unwrap(), Some(lease.holder_token));
    }

    #[tokio::test]
    async fn test_poll_detects_silent_delete() {
        let store = store();
        let lock = PubSubLock::new(store.clone());
        store.set_px("ps:b", "holder", Duration::from_secs(5)).await.unwrap();

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move { waiter_lock.acquire("ps:b", &LockOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Deleted without a publish
        store.del("ps:b").await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(store.get("ps:b").await.unwrap(), Some(lease.holder_token));
    }

    #[tokio::test]
    async fn test_times_out_while_held() {
        let store = store();
        let lock = PubSubLock::new(store.clone());
        store.set_px("ps:c", "holder", Duration::from_secs(5)).await.unwrap();
        let options = LockOptions::default().with_timeout(Duration::from_millis(80));

        let result = lock.acquire("ps:c", &options).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_keeps_lock() {
        let store = store();
        let lock = PubSubLock::new(store.clone());
        let mut lease = lock.acquire("ps:d", &LockOptions::default()).await.unwrap();
        let real_token = lease.holder_token.clone();

        lease.holder_token = "forged".to_string();
        assert!(!lock.release(&lease).await.unwrap());
        assert_eq!(store.get("ps:d").await.unwrap(), Some(real_token));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = Arc::new(PubSubLock::new(store()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let options = LockOptions::default().with_max_attempts(10_000);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lock = lock.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            let options = options.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("ps:shared", &options, |_lease| async move {
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
