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

//! Quorum lock in the Redlock family.
//!
//! The same token is written to N independent stores; the lock is held when
//! a majority accepted it quickly enough that the remaining validity
//! (`ttl - elapsed - drift`) is positive. Otherwise every instance is
//! unlocked and the attempt is retried after a jittered delay. With a single
//! store this degenerates to plain SET-NX locking.

use crate::manager::{new_holder_token, record_acquired, timeout_error};
use crate::{DistributedLock, LockError, LockKeys, LockLease, LockOptions, LockResult, LockStrategy};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use plexspaces_store::{AtomicScripts, LockStore, StoreResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry and drift settings for [`QuorumLock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Base delay between attempts
    pub retry_delay: Duration,
    /// Upper bound of random delay added to `retry_delay`
    pub retry_jitter: Duration,
    /// Fraction of the TTL reserved for clock drift between instances
    pub clock_drift_factor: f64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(50),
            clock_drift_factor: 0.01,
        }
    }
}

/// Majority lock over several stores.
#[derive(Clone)]
pub struct QuorumLock {
    instances: Vec<Arc<dyn LockStore>>,
    config: QuorumConfig,
}

impl QuorumLock {
    /// Create a quorum lock over `instances` with default retry settings.
    pub fn new(instances: Vec<Arc<dyn LockStore>>) -> Self {
        Self::with_config(instances, QuorumConfig::default())
    }

    /// Create a quorum lock with explicit retry settings.
    pub fn with_config(instances: Vec<Arc<dyn LockStore>>, config: QuorumConfig) -> Self {
        Self { instances, config }
    }

    /// Number of instances that must agree.
    pub fn quorum(&self) -> usize {
        self.instances.len() / 2 + 1
    }

    fn drift(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.config.clock_drift_factor) + Duration::from_millis(2)
    }

    fn retry_sleep(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.config.retry_delay + jitter
    }

    fn count_successes(key: &str, results: Vec<StoreResult<bool>>) -> usize {
        results
            .into_iter()
            .enumerate()
            .filter(|(instance, result)| match result {
                Ok(ok) => *ok,
                Err(e) => {
                    debug!(lock_key = %key, instance, error = %e, "quorum instance failed");
                    false
                }
            })
            .count()
    }

    async fn unlock_all(&self, key: &str, token: &str) {
        let results = join_all(self.instances.iter().map(|store| store.compare_and_delete(key, token))).await;
        for (instance, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                warn!(lock_key = %key, instance, error = %e, "quorum unlock failed on instance");
            }
        }
    }

    /// Extend a held lease to `ttl` on a majority of instances.
    ///
    /// ## Errors
    /// [`LockError::Timeout`] when a majority could not be extended in time;
    /// the lease should then be treated as lost.
    pub async fn extend(&self, lease: &LockLease, ttl: Duration) -> LockResult<LockLease> {
        let keys = LockKeys::new(&lease.key)?;
        let started = Instant::now();
        let results = join_all(
            self.instances
                .iter()
                .map(|store| store.extend_lease(&keys.lock, &lease.holder_token, ttl)),
        )
        .await;
        let extended = Self::count_successes(&lease.key, results);

        if extended >= self.quorum() && started.elapsed() + self.drift(ttl) < ttl {
            debug!(lock_key = %lease.key, extended, "quorum lease extended");
            return Ok(LockLease {
                ttl,
                acquired_at: Utc::now(),
                ..lease.clone()
            });
        }
        Err(timeout_error(LockStrategy::Quorum, &lease.key, 1, started))
    }
}

#[async_trait]
impl DistributedLock for QuorumLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease> {
        let keys = LockKeys::new(key)?;
        if self.instances.is_empty() {
            return Err(LockError::ConfigError("quorum lock needs at least one store".to_string()));
        }

        let started = Instant::now();
        let deadline = started + options.timeout;
        let max_attempts = (self.config.retry_count + 1).min(options.max_attempts);
        let drift = self.drift(options.ttl);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let token = new_holder_token();
            let attempt_started = Instant::now();
            let results = join_all(
                self.instances
                    .iter()
                    .map(|store| store.try_acquire(&keys.lock, &token, options.ttl)),
            )
            .await;
            let acquired = Self::count_successes(key, results);
            let elapsed = attempt_started.elapsed();

            if acquired >= self.quorum() && elapsed + drift < options.ttl {
                let validity = options.ttl - elapsed - drift;
                record_acquired(LockStrategy::Quorum, attempts);
                debug!(lock_key = %key, acquired, validity_ms = validity.as_millis() as u64, "quorum lock acquired");
                return Ok(LockLease::new(key, token, options.ttl, LockStrategy::Quorum));
            }

            self.unlock_all(&keys.lock, &token).await;
            let now = Instant::now();
            if attempts >= max_attempts || now >= deadline {
                return Err(timeout_error(LockStrategy::Quorum, key, attempts, started));
            }
            tokio::time::sleep(self.retry_sleep().min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> LockResult<bool> {
        let keys = LockKeys::new(&lease.key)?;
        let results = join_all(
            self.instances
                .iter()
                .map(|store| store.compare_and_delete(&keys.lock, &lease.holder_token)),
        )
        .await;

        let mut released = 0usize;
        let mut first_error = None;
        for (instance, result) in results.into_iter().enumerate() {
            match result {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(lock_key = %lease.key, instance, error = %e, "quorum release failed on instance");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if released == 0 => Err(e.into()),
            _ => Ok(released > 0),
        }
    }

    fn strategy(&self) -> LockStrategy {
        LockStrategy::Quorum
    }

    fn handle(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexspaces_store::InMemoryStore;

    fn instances(n: usize) -> Vec<Arc<dyn LockStore>> {
        (0..n)
            .map(|_| Arc::new(InMemoryStore::new()) as Arc<dyn LockStore>)
            .collect()
    }

    fn fast_config() -> QuorumConfig {
        QuorumConfig {
            retry_count: 2,
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(5),
            clock_drift_factor: 0.01,
        }
    }

    #[tokio::test]
    async fn test_acquires_on_all_instances() {
        let stores = instances(3);
        let lock = QuorumLock::with_config(stores.clone(), fast_config());
        assert_eq!(lock.quorum(), 2);

        let lease = lock.acquire("qr:a", &LockOptions::default()).await.unwrap();
        for store in &stores {
            assert_eq!(store.get("qr:a").await.unwrap(), Some(lease.holder_token.clone()));
        }

        assert!(lock.release(&lease).await.unwrap());
        for store in &stores {
            assert!(!store.exists("qr:a").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_majority_is_enough() {
        let stores = instances(3);
        stores[0].set_px("qr:b", "other", Duration::from_secs(5)).await.unwrap();
        let lock = QuorumLock::with_config(stores.clone(), fast_config());

        let lease = lock.acquire("qr:b", &LockOptions::default()).await.unwrap();
        assert_eq!(stores[1].get("qr:b").await.unwrap(), Some(lease.holder_token.clone()));
        assert_eq!(stores[0].get("qr:b").await.unwrap().as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_minority_times_out_and_unlocks() {
        let stores = instances(3);
        stores[0].set_px("qr:c", "other", Duration::from_secs(5)).await.unwrap();
        stores[1].set_px("qr:c", "other", Duration::from_secs(5)).await.unwrap();
        let lock = QuorumLock::with_config(stores.clone(), fast_config());

        match lock.acquire("qr:c", &LockOptions::default()).await {
            Err(LockError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!stores[2].exists("qr:c").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_refreshes_majority() {
        let stores = instances(3);
        let lock = QuorumLock::with_config(stores.clone(), fast_config());
        let options = LockOptions::default().with_ttl(Duration::from_millis(100));
        let lease = lock.acquire("qr:d", &options).await.unwrap();

        let extended = lock.extend(&lease, Duration::from_secs(5)).await.unwrap();
        assert_eq!(extended.ttl, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(150)).await;
        for store in &stores {
            assert!(store.exists("qr:d").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_extend_after_loss_fails() {
        let stores = instances(3);
        let lock = QuorumLock::with_config(stores.clone(), fast_config());
        let lease = lock.acquire("qr:e", &LockOptions::default()).await.unwrap();
        stores[0].del("qr:e").await.unwrap();
        stores[1].del("qr:e").await.unwrap();

        let result = lock.extend(&lease, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_release_tolerates_failing_instance() {
        let stores = instances(3);
        let lock = QuorumLock::with_config(stores.clone(), fast_config());
        let lease = lock.acquire("qr:f", &LockOptions::default()).await.unwrap();
        // Replace one record with a list so compare-and-delete errors there
        stores[2].del("qr:f").await.unwrap();
        stores[2].rpush("qr:f", "x").await.unwrap();

        assert!(lock.release(&lease).await.unwrap());
        assert!(!stores[0].exists("qr:f").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_instance_degenerates() {
        let stores = instances(1);
        let lock = QuorumLock::new(stores.clone());
        assert_eq!(lock.quorum(), 1);

        let lease = lock.acquire("qr:g", &LockOptions::default()).await.unwrap();
        assert_eq!(lease.strategy, LockStrategy::Quorum);
        assert!(lock.release(&lease).await.unwrap());
    }
}
