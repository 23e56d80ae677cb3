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

//! Order placement saga.
//!
//! ## Stages
//! 1. **Prepare**: validate coupon and points, create the `PENDING` order,
//!    reserve stock for every line. Prepare never rolls itself back.
//! 2. **Process** (optimistic retry): use the coupon, debit points, confirm
//!    reservations, mark the order `SUCCESS`.
//! 3. **Recover** (optimistic retry): run the compensations collected so far
//!    in reverse, ending with the order marked `FAILED`.
//!
//! Each compensation is recorded *before* the step it undoes and is
//! idempotent, so running the list after a partial step is safe and running
//! it twice is a no-op.

use crate::model::{Order, OrderStatus, PointTransactionKind};
use crate::repository::InMemoryRepositories;
use crate::services::{CouponService, NewOrder, OrderService, PointService, RankingService, StockService};
use crate::{SagaConfig, SagaError, SagaResult};
use plexspaces_locks::{build_lock, with_optimistic_retry, FencingLock, LockStrategy};
use plexspaces_store::LockStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Action that undoes one completed (or partially completed) saga step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Compensation {
    /// Return reserved or confirmed stock of the order
    ReleaseStock {
        /// Order id
        order_id: String,
    },
    /// Put a used coupon back to `AVAILABLE`
    RestoreCoupon {
        /// User coupon id
        user_coupon_id: String,
        /// Order id
        order_id: String,
    },
    /// Credit back points debited for the order
    RefundPoints {
        /// User id
        user_id: String,
        /// Order id
        order_id: String,
    },
    /// Move the order to `FAILED`
    MarkFailed {
        /// Order id
        order_id: String,
    },
}

impl Compensation {
    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Compensation::ReleaseStock { .. } => "release_stock",
            Compensation::RestoreCoupon { .. } => "restore_coupon",
            Compensation::RefundPoints { .. } => "refund_points",
            Compensation::MarkFailed { .. } => "mark_failed",
        }
    }

    /// Compensations for the process stage of `order`.
    pub fn for_process(order: &Order) -> Vec<Compensation> {
        let mut actions = Vec::new();
        if let Some(user_coupon_id) = &order.user_coupon_id {
            actions.push(Compensation::RestoreCoupon {
                user_coupon_id: user_coupon_id.clone(),
                order_id: order.id.clone(),
            });
        }
        if order.points_used > 0 {
            actions.push(Compensation::RefundPoints {
                user_id: order.user_id.clone(),
                order_id: order.id.clone(),
            });
        }
        actions
    }

    /// Every compensation an order can need, in recording order.
    pub fn for_order(order: &Order) -> Vec<Compensation> {
        let mut actions = vec![
            Compensation::MarkFailed {
                order_id: order.id.clone(),
            },
            Compensation::ReleaseStock {
                order_id: order.id.clone(),
            },
        ];
        actions.extend(Self::for_process(order));
        actions
    }
}

/// Outcome of [`OrderSaga::recover`].
#[derive(Debug, Clone)]
pub struct Recovery {
    /// Order after compensation
    pub order: Order,
    /// Compensations that changed state; 0 for an already compensated order
    pub changed: usize,
}

/// Orchestrates prepare, process and recover over the business services.
#[derive(Clone)]
pub struct OrderSaga {
    coupons: CouponService,
    stock: StockService,
    points: PointService,
    orders: OrderService,
    ranking: Option<RankingService>,
    config: SagaConfig,
}

impl OrderSaga {
    /// Create a saga.
    pub fn new(
        coupons: CouponService,
        stock: StockService,
        points: PointService,
        orders: OrderService,
        config: SagaConfig,
    ) -> Self {
        Self {
            coupons,
            stock,
            points,
            orders,
            ranking: None,
            config,
        }
    }

    /// Wire every service over `repositories` with locks in `store`.
    ///
    /// Coupon quota uses `config.coupon_lock`, stock a [`FencingLock`] and the
    /// ranking a pub/sub lock.
    pub fn wire(store: Arc<dyn LockStore>, repositories: &InMemoryRepositories, config: SagaConfig) -> Self {
        let coupons = CouponService::new(
            repositories.coupons.clone(),
            repositories.user_coupons.clone(),
            build_lock(config.coupon_lock, store.clone()),
            config.lock.clone(),
            config.service_retry.clone(),
        );
        let stock = StockService::new(
            repositories.products.clone(),
            repositories.reservations.clone(),
            Arc::new(FencingLock::new(store.clone())),
            config.lock.clone(),
        );
        let points = PointService::new(
            repositories.balances.clone(),
            repositories.transactions.clone(),
            config.service_retry.clone(),
        );
        let orders = OrderService::new(repositories.orders.clone(), config.service_retry.clone());
        let ranking = RankingService::new(
            store.clone(),
            build_lock(LockStrategy::PubSub, store),
            config.lock.clone(),
        );
        Self::new(coupons, stock, points, orders, config).with_ranking(ranking)
    }

    /// Record units sold in `ranking` after each successful order.
    pub fn with_ranking(mut self, ranking: RankingService) -> Self {
        self.ranking = Some(ranking);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Order service used by the saga.
    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Coupon service used by the saga.
    pub fn coupons(&self) -> &CouponService {
        &self.coupons
    }

    /// Stock service used by the saga.
    pub fn stock(&self) -> &StockService {
        &self.stock
    }

    /// Point service used by the saga.
    pub fn points(&self) -> &PointService {
        &self.points
    }

    /// Ranking service, when attached.
    pub fn ranking(&self) -> Option<&RankingService> {
        self.ranking.as_ref()
    }

    /// Place an order: prepare, process, and compensate on failure.
    ///
    /// Returns the `SUCCESS` order, or the error of the failing stage after
    /// compensation has run. When compensation itself fails the order is left
    /// for the recovery sweep and the original error is still returned.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, lines = request.items.len()))]
    pub async fn place_order(&self, request: &NewOrder) -> SagaResult<Order> {
        let mut compensations = Vec::new();

        let order = match self.prepare(request, &mut compensations).await {
            Ok(order) => order,
            Err(e) => return Err(self.fail(e, compensations).await),
        };

        compensations.extend(Compensation::for_process(&order));
        let processed = with_optimistic_retry(&self.config.process_retry, "saga.process", || self.process(&order)).await;

        match processed {
            Ok(order) => {
                metrics::counter!("plexspaces_saga_orders_total", "outcome" => "success").increment(1);
                self.record_ranking(&order).await;
                info!(order_id = %order.id, "order placed");
                Ok(order)
            }
            Err(e) => Err(self.fail(e, compensations).await),
        }
    }

    /// Validate coupon and points, create the `PENDING` order and reserve
    /// stock per line, appending compensations to `compensations` as state
    /// is created.
    #[instrument(skip(self, request, compensations), fields(user_id = %request.user_id))]
    pub async fn prepare(&self, request: &NewOrder, compensations: &mut Vec<Compensation>) -> SagaResult<Order> {
        let discount = match &request.user_coupon_id {
            Some(user_coupon_id) => self.coupons.validate(user_coupon_id, &request.user_id).await?,
            None => 0,
        };
        if request.points > 0 {
            self.points.ensure_available(&request.user_id, request.points).await?;
        }

        let order = self.orders.create(request, discount).await?;
        compensations.push(Compensation::MarkFailed {
            order_id: order.id.clone(),
        });
        compensations.push(Compensation::ReleaseStock {
            order_id: order.id.clone(),
        });

        for item in &order.items {
            self.stock.reserve(&order.id, &item.product_id, item.quantity).await?;
        }
        debug!(order_id = %order.id, "order prepared");
        Ok(order)
    }

    /// Finalize a prepared order. Every step is idempotent per order, so the
    /// whole stage can be retried after a version conflict.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn process(&self, order: &Order) -> SagaResult<Order> {
        if let Some(user_coupon_id) = &order.user_coupon_id {
            self.coupons.use_coupon(user_coupon_id, &order.id).await?;
        }
        if order.points_used > 0 {
            self.points.use_points(&order.user_id, &order.id, order.points_used).await?;
        }
        self.stock.confirm(&order.id).await?;
        self.orders.change_status(&order.id, OrderStatus::Success).await
    }

    /// Compensate `order_id` and mark it `FAILED`.
    ///
    /// Safe to call repeatedly; a second call changes nothing and reports
    /// `changed == 0`. Refuses `SUCCESS` orders.
    #[instrument(skip(self))]
    pub async fn recover(&self, order_id: &str) -> SagaResult<Recovery> {
        let order = self.orders.find(order_id).await?;
        if order.status == OrderStatus::Success {
            return Err(SagaError::InvalidState {
                order_id: order_id.to_string(),
                status: order.status.to_string(),
                action: "recover",
            });
        }
        let changed = self.compensate(&Compensation::for_order(&order)).await?;
        Ok(Recovery {
            order: self.orders.find(order_id).await?,
            changed,
        })
    }

    /// Run `actions` newest first, retrying the whole list on version
    /// conflicts. Stops at the first failing action. Returns how many
    /// actions changed state.
    pub async fn compensate(&self, actions: &[Compensation]) -> SagaResult<usize> {
        let changed = AtomicUsize::new(0);
        let changed_ref = &changed;
        with_optimistic_retry(&self.config.recover_retry, "saga.recover", || async move {
            for action in actions.iter().rev() {
                if self.apply(action).await? {
                    changed_ref.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("plexspaces_saga_compensations_total", "action" => action.name()).increment(1);
                }
            }
            Ok::<_, SagaError>(())
        })
        .await?;
        Ok(changed.into_inner())
    }

    /// Apply one compensation; `false` when there was nothing left to undo.
    async fn apply(&self, action: &Compensation) -> SagaResult<bool> {
        match action {
            Compensation::ReleaseStock { order_id } => {
                let released = self.stock.release_for_order(order_id).await?;
                debug!(order_id = %order_id, released, "stock compensated");
                Ok(released > 0)
            }
            Compensation::RestoreCoupon {
                user_coupon_id,
                order_id,
            } => self.coupons.restore(user_coupon_id, order_id).await,
            Compensation::RefundPoints { user_id, order_id } => {
                if self
                    .points
                    .find_transaction(order_id, PointTransactionKind::Refund)
                    .await?
                    .is_some()
                {
                    return Ok(false);
                }
                match self.points.refund(user_id, order_id).await {
                    Ok(_) => Ok(true),
                    Err(SagaError::TransactionNotFound { .. }) => {
                        debug!(order_id = %order_id, "no points to refund");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
            Compensation::MarkFailed { order_id } => {
                if self.orders.find(order_id).await?.status == OrderStatus::Failed {
                    return Ok(false);
                }
                self.orders.change_status(order_id, OrderStatus::Failed).await?;
                Ok(true)
            }
        }
    }

    async fn fail(&self, cause: SagaError, compensations: Vec<Compensation>) -> SagaError {
        metrics::counter!("plexspaces_saga_orders_total", "outcome" => "failed").increment(1);
        if compensations.is_empty() {
            return cause;
        }
        warn!(error = %cause, steps = compensations.len(), "order failed, compensating");
        if let Err(e) = self.compensate(&compensations).await {
            error!(error = %e, cause = %cause, "compensation failed; order left for recovery sweep");
        }
        cause
    }

    async fn record_ranking(&self, order: &Order) {
        let Some(ranking) = &self.ranking else {
            return;
        };
        for item in &order.items {
            if let Err(e) = ranking.record_sale(&item.product_id, item.quantity).await {
                warn!(order_id = %order.id, product_id = %item.product_id, error = %e, "failed to record sale");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderItem;
    use chrono::Utc;

    fn order(coupon: Option<&str>, points: i64) -> Order {
        let now = Utc::now();
        Order {
            id: "o1".to_string(),
            user_id: "u1".to_string(),
            items: vec![OrderItem {
                product_id: "p1".to_string(),
                quantity: 1,
                unit_price: 100,
            }],
            user_coupon_id: coupon.map(str::to_string),
            points_used: points,
            total_amount: 100,
            discount_amount: 0,
            status: OrderStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_full_compensation_list_ends_with_mark_failed() {
        let actions = Compensation::for_order(&order(Some("uc1"), 50));
        let names: Vec<&str> = actions.iter().rev().map(Compensation::name).collect();
        assert_eq!(names, vec!["refund_points", "restore_coupon", "release_stock", "mark_failed"]);
    }

    #[test]
    fn test_process_compensations_skip_unused_resources() {
        assert!(Compensation::for_process(&order(None, 0)).is_empty());
        assert_eq!(
            Compensation::for_process(&order(None, 10)),
            vec![Compensation::RefundPoints {
                user_id: "u1".to_string(),
                order_id: "o1".to_string(),
            }]
        );
    }

    #[test]
    fn test_compensation_serializes_tagged() {
        let json = serde_json::to_value(Compensation::MarkFailed {
            order_id: "o1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "mark_failed");
        assert_eq!(json["order_id"], "o1");
    }
}
