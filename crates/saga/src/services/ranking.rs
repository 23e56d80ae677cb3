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

//! Product popularity ranking.

use crate::{SagaError, SagaResult};
use plexspaces_locks::{DistributedLock, LockOptions, WithLock};
use plexspaces_store::LockStore;
use std::sync::Arc;
use tracing::debug;

/// Sorted-set key holding units sold per product.
pub const DEFAULT_RANKING_KEY: &str = "ranking:products";

/// Units sold per product, kept in a store sorted set.
///
/// Score writes run under a lock on `{key}:lock`; reads go straight to the
/// store.
#[derive(Clone)]
pub struct RankingService {
    store: Arc<dyn LockStore>,
    lock: Arc<dyn DistributedLock>,
    lock_options: LockOptions,
    key: String,
}

impl RankingService {
    /// Ranking under [`DEFAULT_RANKING_KEY`].
    pub fn new(store: Arc<dyn LockStore>, lock: Arc<dyn DistributedLock>, lock_options: LockOptions) -> Self {
        Self {
            store,
            lock,
            lock_options,
            key: DEFAULT_RANKING_KEY.to_string(),
        }
    }

    /// Use a different sorted-set key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Add `quantity` to the product's score. Returns the new score.
    pub async fn record_sale(&self, product_id: &str, quantity: u32) -> SagaResult<f64> {
        let lock_key = format!("{}:lock", self.key);
        let score = self
            .lock
            .with_lock(&lock_key, &self.lock_options, |_lease| async move {
                Ok::<_, SagaError>(self.store.zincrby(&self.key, product_id, f64::from(quantity)).await?)
            })
            .await?;
        debug!(product_id = %product_id, quantity, score, "sale recorded");
        Ok(score)
    }

    /// Drop a product from the ranking.
    pub async fn remove(&self, product_id: &str) -> SagaResult<bool> {
        let lock_key = format!("{}:lock", self.key);
        self.lock
            .with_lock(&lock_key, &self.lock_options, |_lease| async move {
                Ok(self.store.zrem(&self.key, product_id).await?)
            })
            .await
    }

    /// Top `n` products by units sold, highest first.
    pub async fn top(&self, n: usize) -> SagaResult<Vec<(String, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(n - 1).unwrap_or(isize::MAX);
        Ok(self.store.zrevrange_with_scores(&self.key, 0, stop).await?)
    }

    /// Units sold for one product.
    pub async fn score(&self, product_id: &str) -> SagaResult<Option<f64>> {
        Ok(self.store.zscore(&self.key, product_id).await?)
    }
}
