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

//! Order saga integration tests over the in-memory store.
//!
//! Covers:
//! - Successful placement across coupon, points, stock and ranking
//! - Compensation round-trip when process fails after stock and points moved
//! - Prepare failure releasing earlier reservations
//! - Coupon quota under contention (5 coupons, 10 requests)

use async_trait::async_trait;
use plexspaces_locks::{FencingLock, LockError, LockOptions, QueueLock, RetryPolicy};
use plexspaces_saga::model::{Coupon, OrderItem, PointBalance, Product, ReservationStatus, UserCouponStatus};
use plexspaces_saga::services::{CouponService, NewOrder, OrderService, PointService, StockService};
use plexspaces_saga::{
    InMemoryRepositories, InMemoryRepository, Order, OrderSaga, OrderStatus, SagaConfig, SagaError, SagaResult,
    VersionedRepository,
};
use plexspaces_store::{InMemoryStore, LockStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> SagaConfig {
    SagaConfig {
        lock: LockOptions::default().with_max_attempts(10_000),
        service_retry: RetryPolicy::new(20, Duration::from_millis(1)),
        process_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        recover_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..SagaConfig::default()
    }
}

async fn seed(repositories: &InMemoryRepositories) {
    repositories.products.save(Product::new("p1", "mug", 1_000, 10)).await.unwrap();
    repositories.products.save(Product::new("p2", "plate", 500, 1)).await.unwrap();
    repositories.coupons.save(Coupon::new("c1", "welcome", 300, 5)).await.unwrap();
    repositories.balances.save(PointBalance::new("u1", 1_000)).await.unwrap();
}

fn line(product_id: &str, quantity: u32, unit_price: i64) -> OrderItem {
    OrderItem {
        product_id: product_id.to_string(),
        quantity,
        unit_price,
    }
}

/// Order repository that refuses to store `SUCCESS`.
struct FailOnSuccess {
    inner: InMemoryRepository<Order>,
}

#[async_trait]
impl VersionedRepository<Order> for FailOnSuccess {
    async fn find_by_id(&self, id: &str) -> SagaResult<Option<Order>> {
        self.inner.find_by_id(id).await
    }

    async fn find_all(&self) -> SagaResult<Vec<Order>> {
        self.inner.find_all().await
    }

    async fn save(&self, order: Order) -> SagaResult<Order> {
        if order.status == OrderStatus::Success {
            return Err(SagaError::Store(StoreError::BackendError("order table unavailable".to_string())));
        }
        self.inner.save(order).await
    }

    async fn delete(&self, id: &str) -> SagaResult<bool> {
        self.inner.delete(id).await
    }
}

fn saga_failing_on_success(store: Arc<dyn LockStore>, repositories: &InMemoryRepositories) -> OrderSaga {
    let config = fast_config();
    OrderSaga::new(
        CouponService::new(
            repositories.coupons.clone(),
            repositories.user_coupons.clone(),
            Arc::new(QueueLock::new(store.clone())),
            config.lock.clone(),
            config.service_retry.clone(),
        ),
        StockService::new(
            repositories.products.clone(),
            repositories.reservations.clone(),
            Arc::new(FencingLock::new(store)),
            config.lock.clone(),
        ),
        PointService::new(
            repositories.balances.clone(),
            repositories.transactions.clone(),
            config.service_retry.clone(),
        ),
        OrderService::new(
            Arc::new(FailOnSuccess {
                inner: InMemoryRepository::new(),
            }),
            config.service_retry.clone(),
        ),
        config,
    )
}

#[tokio::test]
async fn test_place_order_success() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = OrderSaga::wire(store, &repositories, fast_config());

    let coupon = saga.coupons().issue("c1", "u1").await.unwrap();
    let order = saga
        .place_order(&NewOrder {
            user_id: "u1".to_string(),
            items: vec![line("p1", 2, 1_000)],
            user_coupon_id: Some(coupon.id.clone()),
            points: 400,
        })
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Success);
    assert_eq!(order.discount_amount, 300);
    assert_eq!(order.payable_amount(), 1_300);
    assert_eq!(saga.stock().available("p1").await.unwrap(), 8);
    assert_eq!(saga.points().balance("u1").await.unwrap(), 600);
    assert_eq!(
        saga.coupons().find_user_coupon(&coupon.id).await.unwrap().status,
        UserCouponStatus::Used
    );

    let reservations = saga.stock().reservations_for(&order.id).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Confirmed);

    let ranking = saga.ranking().unwrap();
    assert_eq!(ranking.score("p1").await.unwrap(), Some(2.0));
}

#[tokio::test]
async fn test_process_failure_compensates_everything() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = saga_failing_on_success(store, &repositories);

    let coupon = saga.coupons().issue("c1", "u1").await.unwrap();
    let stock_before = saga.stock().available("p1").await.unwrap();
    let balance_before = saga.points().balance("u1").await.unwrap();

    let err = saga
        .place_order(&NewOrder {
            user_id: "u1".to_string(),
            items: vec![line("p1", 3, 1_000)],
            user_coupon_id: Some(coupon.id.clone()),
            points: 250,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::Store(_)));
    assert!(!err.is_transient());

    assert_eq!(saga.stock().available("p1").await.unwrap(), stock_before);
    assert_eq!(saga.points().balance("u1").await.unwrap(), balance_before);
    let restored = saga.coupons().find_user_coupon(&coupon.id).await.unwrap();
    assert_eq!(restored.status, UserCouponStatus::Available);
    assert_eq!(restored.used_order_id, None);

    let failed = saga
        .orders()
        .find_recoverable(chrono::Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, OrderStatus::Failed);
    let reservations = saga.stock().reservations_for(&failed[0].id).await.unwrap();
    assert!(reservations.iter().all(|r| r.status == ReservationStatus::Released));

    // recovering again changes nothing
    saga.recover(&failed[0].id).await.unwrap();
    assert_eq!(saga.stock().available("p1").await.unwrap(), stock_before);
    assert_eq!(saga.points().balance("u1").await.unwrap(), balance_before);
}

#[tokio::test]
async fn test_prepare_failure_releases_earlier_lines() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = OrderSaga::wire(store, &repositories, fast_config());

    let err = saga
        .place_order(&NewOrder {
            user_id: "u1".to_string(),
            items: vec![line("p1", 4, 1_000), line("p2", 2, 500)],
            user_coupon_id: None,
            points: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaError::InsufficientStock {
            requested: 2,
            available: 1,
            ..
        }
    ));

    assert_eq!(saga.stock().available("p1").await.unwrap(), 10);
    assert_eq!(saga.stock().available("p2").await.unwrap(), 1);
    let orders = repositories.orders.find_all().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Failed);
}

#[tokio::test]
async fn test_validation_failure_creates_no_order() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = OrderSaga::wire(store, &repositories, fast_config());

    let err = saga
        .place_order(&NewOrder {
            user_id: "u1".to_string(),
            items: vec![line("p1", 1, 1_000)],
            user_coupon_id: None,
            points: 5_000,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::InsufficientPoints { .. }));
    assert!(repositories.orders.is_empty().await);
    assert_eq!(saga.stock().available("p1").await.unwrap(), 10);
}

#[tokio::test]
async fn test_coupon_quota_under_contention() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = Arc::new(OrderSaga::wire(store, &repositories, fast_config()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let saga = saga.clone();
        handles.push(tokio::spawn(async move {
            saga.coupons().issue("c1", &format!("user-{}", i)).await
        }));
    }

    let mut issued = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => issued += 1,
            Err(SagaError::QuotaExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(issued, 5);
    assert_eq!(exhausted, 5);

    let coupon = repositories.coupons.find_by_id("c1").await.unwrap().unwrap();
    assert_eq!(coupon.issued_quantity, 5);
    assert_eq!(repositories.user_coupons.len().await, 5);
}

#[tokio::test]
async fn test_concurrent_orders_never_oversell() {
    let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
    let repositories = InMemoryRepositories::new();
    seed(&repositories).await;
    let saga = Arc::new(OrderSaga::wire(store, &repositories, fast_config()));

    let mut handles = Vec::new();
    for i in 0..6 {
        let saga = saga.clone();
        handles.push(tokio::spawn(async move {
            saga.place_order(&NewOrder {
                user_id: format!("buyer-{}", i),
                items: vec![line("p1", 2, 1_000)],
                user_coupon_id: None,
                points: 0,
            })
            .await
        }));
    }

    let mut placed: u32 = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, OrderStatus::Success);
                placed += 1;
            }
            Err(SagaError::InsufficientStock { .. }) => {}
            // lost the product lock to a newer fencing token
            Err(SagaError::Lock(LockError::FencingTokenViolation { .. })) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert!((1..=5).contains(&placed));
    assert_eq!(saga.stock().available("p1").await.unwrap(), 10 - 2 * placed);
}
