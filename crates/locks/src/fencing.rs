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

//! Fencing lock: a pub/sub lock that also hands out a monotonically
//! increasing token per key.
//!
//! A holder whose lease silently expired may still be running. The token lets
//! the protected resource reject that holder's late writes: a repository
//! accepts a write only when the caller's token is at least the last token it
//! saw, then advances it.

use crate::manager::{new_holder_token, record_acquired};
use crate::{
    DistributedLock, LockError, LockKeys, LockLease, LockOptions, LockResult, LockStrategy, PubSubLock, WithLock,
};
use async_trait::async_trait;
use plexspaces_store::{AtomicScripts, LockStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TTL of `K:fencing_value`, the currently valid token.
pub const DEFAULT_FENCING_VALUE_TTL: Duration = Duration::from_millis(10_000);

/// TTL of the `K:fencing` counter, refreshed on every issue. Long enough that
/// tokens keep increasing across normal gaps between acquisitions.
pub const DEFAULT_FENCING_COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pub/sub lock plus fencing token.
///
/// ## Acquisition
/// 1. `INCR K:fencing` (TTL refreshed) to obtain the token
/// 2. Acquire the underlying [`PubSubLock`]
/// 3. Store the token as `K:fencing_value` (10s TTL)
/// 4. Check that `K:fencing_value` still holds this token; otherwise release
///    and fail with [`LockError::FencingTokenViolation`]
///
/// The token belongs to the request, so acquisition order and token order
/// may differ under contention. A waiter that acquires after a newer token
/// already wrote to the protected resource has its writes rejected there.
///
/// ## Examples
/// ```rust
/// use plexspaces_locks::{FencingLock, LockError, LockOptions};
/// use plexspaces_store::InMemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), LockError> {
/// let lock = FencingLock::new(Arc::new(InMemoryStore::new()));
/// let token = lock
///     .with_fencing_token("product:7", &LockOptions::default(), |token| async move {
///         Ok::<_, LockError>(token)
///     })
///     .await?;
/// assert_eq!(token, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FencingLock {
    store: Arc<dyn LockStore>,
    inner: PubSubLock,
    value_ttl: Duration,
    counter_ttl: Duration,
}

impl FencingLock {
    /// Create a fencing lock over `store`.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            inner: PubSubLock::new(store.clone()),
            store,
            value_ttl: DEFAULT_FENCING_VALUE_TTL,
            counter_ttl: DEFAULT_FENCING_COUNTER_TTL,
        }
    }

    /// Override the TTL of the stored current token.
    pub fn with_value_ttl(mut self, value_ttl: Duration) -> Self {
        self.value_ttl = value_ttl;
        self
    }

    /// Override the TTL of the token counter.
    pub fn with_counter_ttl(mut self, counter_ttl: Duration) -> Self {
        self.counter_ttl = counter_ttl;
        self
    }

    /// Token currently stored for `key`, if still within its TTL window.
    pub async fn current_fencing_token(&self, key: &str) -> LockResult<Option<i64>> {
        let keys = LockKeys::new(key)?;
        match self.store.get(&keys.fencing_value).await? {
            None => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
                LockError::Store(StoreError::SerializationError(format!(
                    "fencing value at {} is not an integer: {}",
                    keys.fencing_value, raw
                )))
            }),
        }
    }

    /// `true` when `token` is the current token for `key`.
    pub async fn validate_fencing_token(&self, key: &str, token: i64) -> LockResult<bool> {
        Ok(self.current_fencing_token(key).await? == Some(token))
    }

    /// Run `operation` with the fencing token while holding the lock.
    pub async fn with_fencing_token<T, E, F, Fut>(&self, key: &str, options: &LockOptions, operation: F) -> Result<T, E>
    where
        F: FnOnce(i64) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<LockError> + Send,
    {
        // acquire() always sets the token
        self.with_lock(key, options, move |lease| operation(lease.fencing_token.unwrap_or_default()))
            .await
    }

    async fn abandon(&self, lease: &LockLease) {
        if let Err(e) = self.inner.release(lease).await {
            warn!(lock_key = %lease.key, error = %e, "failed to release lock after fencing check");
        }
    }
}

#[async_trait]
impl DistributedLock for FencingLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> LockResult<LockLease> {
        let keys = LockKeys::new(key)?;
        let token = self.store.issue_fencing_token(&keys.fencing, self.counter_ttl).await?;
        let mut lease = self.inner.acquire_with_token(key, new_holder_token(), options).await?;
        lease.strategy = LockStrategy::Fencing;
        lease.fencing_token = Some(token);

        if let Err(e) = self
            .store
            .set_px(&keys.fencing_value, &token.to_string(), self.value_ttl)
            .await
        {
            self.abandon(&lease).await;
            return Err(e.into());
        }

        match self.validate_fencing_token(key, token).await {
            Ok(true) => {
                record_acquired(LockStrategy::Fencing, 1);
                debug!(lock_key = %key, fencing_token = token, "fencing lock acquired");
                Ok(lease)
            }
            Ok(false) => {
                let current = self.current_fencing_token(key).await.ok().flatten();
                self.abandon(&lease).await;
                metrics::counter!("plexspaces_lock_fencing_violations_total").increment(1);
                warn!(lock_key = %key, issued = token, current = ?current, "fencing token superseded before use");
                Err(LockError::FencingTokenViolation {
                    key: key.to_string(),
                    issued: token,
                    current,
                })
            }
            Err(e) => {
                self.abandon(&lease).await;
                Err(e)
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> LockResult<bool> {
        self.inner.release(lease).await
    }

    fn strategy(&self) -> LockStrategy {
        LockStrategy::Fencing
    }

    fn handle(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}
