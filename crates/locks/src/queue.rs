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

//! Queue lock: explicit FIFO of waiters with addressed wake-ups.

use crate::manager::{new_holder_token, record_acquired, timeout_error};
use crate::{DistributedLock, LockKeys, LockLease, LockOptions, LockResult, LockStrategy};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use plexspaces_store::{AtomicScripts, LockStore, QueueEntry, ReleaseOutcome};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// FIFO lock.
///
/// ## Acquisition
/// 1. Try `SET NX PX` immediately
/// 2. Subscribe to `K:channel`, append `{clientId, enqueuedAt}` to `K:queue`
///    (idempotent per client, list TTL refreshed), retry once
/// 3. Wait for a message naming this client, then try to acquire; if that
///    fails (lost a race with expiry or a non-queued caller) re-enqueue at
///    the tail
///
/// Once per lock TTL the waiter also checks for an abandoned lock (holder
/// crashed, nobody to notify) and re-enqueues itself if its entry was
/// dropped as stale.
///
/// ## Release
/// One script verifies the token, deletes the key, pops waiters from the
/// head discarding entries older than the lock TTL, and publishes the first
/// live client id.
///
/// Waiters are served in enqueue order. Mixing this strategy with others on
/// the same key gives no ordering guarantee.
#[derive(Clone)]
pub struct QueueLock {
    store: Arc<dyn LockStore>,
}

impl QueueLock {
    /// Create a queue lock over `store`.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    fn entry(client_id: &str) -> QueueEntry {
        QueueEntry {
            client_id: client_id.to_string(),
            enqueued_at: Utc::now().timestamp_millis(),
        }
    }

    fn acquired(key: &str, token: String, options: &LockOptions, attempts: u32) -> LockLease {
        record_acquired(LockStrategy::Queue, attempts);
        trace!(lock_key = %key, holder = %token, attempts, "queue lock acquired");
        LockLease::new(key, token, options.ttl, LockStrategy::Queue)
    }

    async fn leave_queue(&self, keys: &LockKeys, client_id: &str) {
        if let Err(e) = self.store.remove_waiter(&keys.queue, client_id).await {
            warn!(lock_key = %keys.lock, client_id = %client_id, error = %e, "failed to remove queue entry");
        }
    }
}

#[async_trait]
impl DistributedLock for QueueLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease> {
        let keys = LockKeys::new(key)?;
        let token = new_holder_token();
        // The holder token doubles as the waiter's client id
        let client_id = token.clone();
        let started = Instant::now();
        let deadline = started + options.timeout;
        let queue_ttl = options.timeout + options.ttl;
        let mut attempts = 1u32;

        if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
            return Ok(Self::acquired(key, token, options, attempts));
        }

        let mut subscription = self.store.subscribe(&keys.channel).await?;
        self.store
            .enqueue_waiter(&keys.queue, &Self::entry(&client_id), queue_ttl)
            .await?;
        debug!(lock_key = %key, client_id = %client_id, "waiting in lock queue");

        attempts += 1;
        if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
            self.leave_queue(&keys, &client_id).await;
            return Ok(Self::acquired(key, token, options, attempts));
        }

        let mut safety_net = tokio::time::interval_at(Instant::now() + options.ttl, options.ttl);
        safety_net.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.leave_queue(&keys, &client_id).await;
                    return Err(timeout_error(LockStrategy::Queue, key, attempts, started));
                }
                message = subscription.next() => match message {
                    Some(notified) if notified == client_id => {
                        attempts += 1;
                        if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
                            return Ok(Self::acquired(key, token, options, attempts));
                        }
                        debug!(lock_key = %key, client_id = %client_id, "notified but lock taken, re-enqueueing");
                        self.store
                            .enqueue_waiter(&keys.queue, &Self::entry(&client_id), queue_ttl)
                            .await?;
                    }
                    Some(_) => {}
                    None => {
                        warn!(lock_key = %key, "queue subscription closed, relying on expiry checks");
                        subscription = futures::stream::pending::<String>().boxed();
                    }
                },
                _ = safety_net.tick() => {
                    if !self.store.exists(&keys.lock).await? {
                        attempts += 1;
                        if self.store.try_acquire(&keys.lock, &token, options.ttl).await? {
                            self.leave_queue(&keys, &client_id).await;
                            return Ok(Self::acquired(key, token, options, attempts));
                        }
                    }
                    let requeued = self
                        .store
                        .enqueue_waiter(&keys.queue, &Self::entry(&client_id), queue_ttl)
                        .await?;
                    if requeued {
                        debug!(lock_key = %key, client_id = %client_id, "queue entry had been dropped, re-enqueued");
                    }
                }
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> LockResult<bool> {
        let keys = LockKeys::new(&lease.key)?;
        let outcome = self
            .store
            .release_and_notify_next(
                &keys.lock,
                &lease.holder_token,
                &keys.queue,
                &keys.channel,
                lease.ttl,
                Utc::now().timestamp_millis(),
            )
            .await?;

        match outcome {
            ReleaseOutcome::NotHeld => {
                warn!(lock_key = %lease.key, holder = %lease.holder_token, "queue lock no longer held at release");
                Ok(false)
            }
            ReleaseOutcome::Released { notified } => {
                trace!(lock_key = %lease.key, next = ?notified, "queue lock released");
                Ok(true)
            }
        }
    }

    fn strategy(&self) -> LockStrategy {
        LockStrategy::Queue
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
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn store() -> Arc<dyn LockStore> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn test_waiters_served_in_enqueue_order() {
        let store = store();
        let lock = Arc::new(QueueLock::new(store.clone()));
        let holder = lock.acquire("q:fifo", &LockOptions::default()).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("q:fifo", &LockOptions::default(), |_lease| async move {
                    order.lock().await.push(i);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<(), LockError>(())
                })
                .await
            }));
            // Wait until waiter i is in the queue before starting the next one
            while store.llen("q:fifo:queue").await.unwrap() < i + 1 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        assert!(lock.release(&holder).await.unwrap());
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
        assert!(!store.exists("q:fifo:queue").await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_removes_queue_entry() {
        let store = store();
        let lock = QueueLock::new(store.clone());
        store.set_px("q:busy", "holder", Duration::from_secs(5)).await.unwrap();
        let options = LockOptions::default().with_timeout(Duration::from_millis(60));

        let result = lock.acquire("q:busy", &options).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert_eq!(store.llen("q:busy:queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_waiter_is_skipped() {
        let store = store();
        let lock = QueueLock::new(store.clone());
        let holder = lock.acquire("q:stale", &LockOptions::default()).await.unwrap();

        let stale = QueueEntry {
            client_id: "ghost".to_string(),
            enqueued_at: Utc::now().timestamp_millis() - 60_000,
        };
        store
            .enqueue_waiter("q:stale:queue", &stale, Duration::from_secs(30))
            .await
            .unwrap();
        let mut channel = store.subscribe("q:stale:channel").await.unwrap();

        assert!(lock.release(&holder).await.unwrap());
        assert_eq!(store.llen("q:stale:queue").await.unwrap(), 0);
        let nothing = tokio::time::timeout(Duration::from_millis(50), channel.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_picked_up_after_expiry() {
        let store = store();
        let lock = QueueLock::new(store.clone());
        // Crashed holder: nobody will release or notify
        store.set_px("q:crash", "crashed", Duration::from_millis(100)).await.unwrap();
        let options = LockOptions::default().with_ttl(Duration::from_millis(100));

        let lease = lock.acquire("q:crash", &options).await.unwrap();
        assert_eq!(store.get("q:crash").await.unwrap(), Some(lease.holder_token));
    }
}
