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

//! Repository contracts for versioned aggregates, and an in-memory
//! implementation.

use crate::model::{
    Aggregate, Coupon, FencedAggregate, Order, PointBalance, PointTransaction, Product, StockReservation, UserCoupon,
};
use crate::{SagaError, SagaResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Mutation applied by [`FencedRepository::update_with_fencing_token`].
pub type Patch<A> = Box<dyn FnOnce(&mut A) + Send>;

/// Load and save aggregates with optimistic version checks.
#[async_trait]
pub trait VersionedRepository<A: Aggregate>: Send + Sync {
    /// Aggregate by id.
    async fn find_by_id(&self, id: &str) -> SagaResult<Option<A>>;

    /// All aggregates, in no particular order.
    async fn find_all(&self) -> SagaResult<Vec<A>>;

    /// Save `aggregate` if the stored version (0 when absent) equals
    /// `aggregate.version()`. Returns the saved copy with the version
    /// incremented; a mismatch fails with an optimistic lock conflict.
    async fn save(&self, aggregate: A) -> SagaResult<A>;

    /// Remove an aggregate. Returns `false` when nothing was stored.
    async fn delete(&self, id: &str) -> SagaResult<bool>;
}

/// Writes guarded by fencing tokens.
#[async_trait]
pub trait FencedRepository<A: FencedAggregate>: VersionedRepository<A> {
    /// Apply `patch` when `token` is at least the last accepted token, then
    /// record `token` and bump the version. Returns `false` for a stale token.
    ///
    /// An equal token is accepted: one lease may write the same row more than
    /// once, and a later lease always carries a higher token.
    async fn update_with_fencing_token(&self, id: &str, token: i64, patch: Patch<A>) -> SagaResult<bool>;
}

/// Aggregates held in a map behind an async `RwLock`.
///
/// Save runs its version check and write under one write lock.
pub struct InMemoryRepository<A> {
    rows: Arc<RwLock<HashMap<String, A>>>,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Aggregate> InMemoryRepository<A> {
    /// Empty repository.
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            _marker: PhantomData,
        }
    }

    /// Number of stored aggregates.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// `true` when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl<A: Aggregate> Default for InMemoryRepository<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for InMemoryRepository<A> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Aggregate> VersionedRepository<A> for InMemoryRepository<A> {
    async fn find_by_id(&self, id: &str) -> SagaResult<Option<A>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> SagaResult<Vec<A>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn save(&self, mut aggregate: A) -> SagaResult<A> {
        let mut rows = self.rows.write().await;
        let stored = rows.get(aggregate.id()).map(Aggregate::version).unwrap_or(0);
        if stored != aggregate.version() {
            debug!(entity = A::ENTITY, id = %aggregate.id(), expected = aggregate.version(), actual = stored, "version conflict");
            return Err(SagaError::conflict(A::ENTITY, aggregate.id(), aggregate.version(), stored));
        }
        aggregate.set_version(stored + 1);
        rows.insert(aggregate.id().to_string(), aggregate.clone());
        Ok(aggregate)
    }

    async fn delete(&self, id: &str) -> SagaResult<bool> {
        Ok(self.rows.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl<A: FencedAggregate> FencedRepository<A> for InMemoryRepository<A> {
    async fn update_with_fencing_token(&self, id: &str, token: i64, patch: Patch<A>) -> SagaResult<bool> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(id).ok_or_else(|| SagaError::not_found(A::ENTITY, id))?;
        if let Some(last) = row.last_fencing_token() {
            if token < last {
                debug!(entity = A::ENTITY, id = %id, token, last, "stale fencing token rejected");
                return Ok(false);
            }
        }
        patch(row);
        row.set_last_fencing_token(token);
        let next = row.version() + 1;
        row.set_version(next);
        Ok(true)
    }
}

/// One in-memory repository per aggregate, shared by clones.
#[derive(Clone, Default)]
pub struct InMemoryRepositories {
    /// Products
    pub products: Arc<InMemoryRepository<Product>>,
    /// Stock reservations
    pub reservations: Arc<InMemoryRepository<StockReservation>>,
    /// Coupon definitions
    pub coupons: Arc<InMemoryRepository<Coupon>>,
    /// Issued user coupons
    pub user_coupons: Arc<InMemoryRepository<UserCoupon>>,
    /// Point wallets
    pub balances: Arc<InMemoryRepository<PointBalance>>,
    /// Point movements
    pub transactions: Arc<InMemoryRepository<PointTransaction>>,
    /// Orders
    pub orders: Arc<InMemoryRepository<Order>>,
}

impl InMemoryRepositories {
    /// Empty repositories.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coupon, Product};

    #[tokio::test]
    async fn test_save_increments_version() {
        let repo = InMemoryRepository::<Coupon>::new();
        let saved = repo.save(Coupon::new("c1", "welcome", 500, 10)).await.unwrap();
        assert_eq!(saved.version, 1);

        let mut loaded = repo.find_by_id("c1").await.unwrap().unwrap();
        loaded.issued_quantity = 1;
        let saved = repo.save(loaded).await.unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_save_rejected() {
        let repo = InMemoryRepository::<Coupon>::new();
        repo.save(Coupon::new("c1", "welcome", 500, 10)).await.unwrap();

        let first = repo.find_by_id("c1").await.unwrap().unwrap();
        let second = first.clone();
        repo.save(first).await.unwrap();

        let err = repo.save(second).await.unwrap_err();
        match err {
            SagaError::Lock(plexspaces_locks::LockError::OptimisticLock {
                entity,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(entity, "Coupon");
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = InMemoryRepository::<Coupon>::new();
        repo.save(Coupon::new("c1", "welcome", 500, 10)).await.unwrap();
        assert!(repo.save(Coupon::new("c1", "again", 100, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_lower_token_rejected_higher_accepted() {
        let repo = InMemoryRepository::<Product>::new();
        repo.save(Product::new("p1", "lamp", 2_000, 10)).await.unwrap();

        assert!(repo
            .update_with_fencing_token("p1", 33, Box::new(|p: &mut Product| p.stock -= 1))
            .await
            .unwrap());
        assert!(!repo
            .update_with_fencing_token("p1", 32, Box::new(|p: &mut Product| p.stock -= 1))
            .await
            .unwrap());
        assert!(repo
            .update_with_fencing_token("p1", 33, Box::new(|p: &mut Product| p.stock -= 1))
            .await
            .unwrap());
        assert!(repo
            .update_with_fencing_token("p1", 40, Box::new(|p: &mut Product| p.stock -= 1))
            .await
            .unwrap());

        let product = repo.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(product.stock, 7);
        assert_eq!(product.last_fencing_token, Some(40));
        assert_eq!(product.version, 4);
    }

    #[tokio::test]
    async fn test_equal_token_accepted_only_until_superseded() {
        let repo = InMemoryRepository::<Product>::new();
        repo.save(Product::new("p1", "lamp", 2_000, 10)).await.unwrap();

        // one lease: take stock, then put it back
        assert!(repo
            .update_with_fencing_token("p1", 5, Box::new(|p: &mut Product| p.stock -= 2))
            .await
            .unwrap());
        assert!(repo
            .update_with_fencing_token("p1", 5, Box::new(|p: &mut Product| p.stock += 2))
            .await
            .unwrap());

        assert!(repo
            .update_with_fencing_token("p1", 6, Box::new(|p: &mut Product| p.stock -= 1))
            .await
            .unwrap());
        assert!(!repo
            .update_with_fencing_token("p1", 5, Box::new(|p: &mut Product| p.stock += 100))
            .await
            .unwrap());

        let product = repo.find_by_id("p1").await.unwrap().unwrap();
        assert_eq!(product.stock, 9);
        assert_eq!(product.last_fencing_token, Some(6));
    }

    #[tokio::test]
    async fn test_fenced_update_of_missing_row() {
        let repo = InMemoryRepository::<Product>::new();
        let err = repo
            .update_with_fencing_token("nope", 1, Box::new(|_p: &mut Product| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::NotFound { entity: "Product", .. }));
    }
}
