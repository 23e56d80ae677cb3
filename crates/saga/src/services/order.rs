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

//! Order records and status changes.

use crate::model::{Order, OrderItem, OrderStatus};
use crate::repository::VersionedRepository;
use crate::{SagaError, SagaResult};
use chrono::{DateTime, Utc};
use plexspaces_locks::{with_optimistic_retry, RetryPolicy};
use std::sync::Arc;
use tracing::info;
use ulid::Ulid;

/// Order placement input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    /// Buyer
    pub user_id: String,
    /// Lines; at least one
    pub items: Vec<OrderItem>,
    /// Coupon to apply
    pub user_coupon_id: Option<String>,
    /// Points to debit
    pub points: i64,
}

/// Creates orders and moves them between statuses.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn VersionedRepository<Order>>,
    retry: RetryPolicy,
}

impl OrderService {
    /// Create a service.
    pub fn new(orders: Arc<dyn VersionedRepository<Order>>, retry: RetryPolicy) -> Self {
        Self { orders, retry }
    }

    /// Validate and persist a `PENDING` order.
    pub async fn create(&self, request: &NewOrder, discount_amount: i64) -> SagaResult<Order> {
        if request.items.is_empty() {
            return Err(SagaError::InvalidOrder("order has no items".to_string()));
        }
        if request.points < 0 {
            return Err(SagaError::InvalidOrder(format!("negative points: {}", request.points)));
        }
        if let Some(item) = request.items.iter().find(|i| i.quantity == 0 || i.unit_price < 0) {
            return Err(SagaError::InvalidOrder(format!("invalid line for product {}", item.product_id)));
        }

        let now = Utc::now();
        let order = self
            .orders
            .save(Order {
                id: Ulid::new().to_string(),
                user_id: request.user_id.clone(),
                items: request.items.clone(),
                user_coupon_id: request.user_coupon_id.clone(),
                points_used: request.points,
                total_amount: request.items.iter().map(OrderItem::subtotal).sum(),
                discount_amount,
                status: OrderStatus::Pending,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;
        metrics::counter!("plexspaces_orders_created_total").increment(1);
        info!(order_id = %order.id, user_id = %order.user_id, total = order.total_amount, "order created");
        Ok(order)
    }

    /// Move `order_id` to `status`, refreshing `updated_at`. Retried on
    /// version conflicts.
    pub async fn change_status(&self, order_id: &str, status: OrderStatus) -> SagaResult<Order> {
        with_optimistic_retry(&self.retry, "order.change_status", || async move {
            let mut order = self.find(order_id).await?;
            let previous = order.status;
            order.status = status;
            order.updated_at = Utc::now();
            let order = self.orders.save(order).await?;
            info!(order_id = %order_id, from = %previous, to = %status, "order status changed");
            Ok(order)
        })
        .await
    }

    /// Cancel an order.
    pub async fn cancel(&self, order_id: &str) -> SagaResult<Order> {
        self.change_status(order_id, OrderStatus::Cancelled).await
    }

    /// Order by id.
    pub async fn find(&self, order_id: &str) -> SagaResult<Order> {
        self.orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", order_id))
    }

    /// `FAILED` orders plus `PENDING` orders created before `pending_before`.
    pub async fn find_recoverable(&self, pending_before: DateTime<Utc>) -> SagaResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .find_all()
            .await?
            .into_iter()
            .filter(|o| match o.status {
                OrderStatus::Failed => true,
                OrderStatus::Pending => o.created_at < pending_before,
                _ => false,
            })
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use chrono::Duration as ChronoDuration;

    fn service() -> OrderService {
        OrderService::new(Arc::new(InMemoryRepository::<Order>::new()), RetryPolicy::default())
    }

    fn request() -> NewOrder {
        NewOrder {
            user_id: "u1".to_string(),
            items: vec![
                OrderItem {
                    product_id: "p1".to_string(),
                    quantity: 2,
                    unit_price: 1_500,
                },
                OrderItem {
                    product_id: "p2".to_string(),
                    quantity: 1,
                    unit_price: 700,
                },
            ],
            user_coupon_id: None,
            points: 0,
        }
    }

    #[tokio::test]
    async fn test_create_pending_with_total() {
        let orders = service();
        let order = orders.create(&request(), 0).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, 3_700);
        assert_eq!(order.version, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_order() {
        let orders = service();
        let mut empty = request();
        empty.items.clear();
        assert!(matches!(orders.create(&empty, 0).await, Err(SagaError::InvalidOrder(_))));
    }

    #[tokio::test]
    async fn test_any_status_to_any_status() {
        let orders = service();
        let order = orders.create(&request(), 0).await.unwrap();

        let failed = orders.change_status(&order.id, OrderStatus::Failed).await.unwrap();
        assert!(failed.updated_at >= order.updated_at);
        let success = orders.change_status(&order.id, OrderStatus::Success).await.unwrap();
        assert_eq!(success.status, OrderStatus::Success);
        let cancelled = orders.cancel(&order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.version, 4);
    }

    #[tokio::test]
    async fn test_find_recoverable() {
        let orders = service();
        let fresh = orders.create(&request(), 0).await.unwrap();
        let failed = orders.create(&request(), 0).await.unwrap();
        orders.change_status(&failed.id, OrderStatus::Failed).await.unwrap();
        let done = orders.create(&request(), 0).await.unwrap();
        orders.change_status(&done.id, OrderStatus::Success).await.unwrap();

        let now_ids: Vec<String> = orders
            .find_recoverable(Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(now_ids, vec![failed.id.clone()]);

        let later = orders
            .find_recoverable(Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
        assert!(later.iter().any(|o| o.id == fresh.id));
    }
}
