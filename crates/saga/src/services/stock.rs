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

//! Stock reservation.

use crate::model::{Product, ReservationStatus, StockReservation};
use crate::repository::{FencedRepository, VersionedRepository};
use crate::{SagaError, SagaResult};
use chrono::Utc;
use plexspaces_locks::{FencingLock, LockError, LockOptions, WithLock};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reserves, confirms and releases product stock.
///
/// Every stock change and every reservation row write runs under a
/// [`FencingLock`] on `product:{id}`. Stock is written with
/// [`FencedRepository::update_with_fencing_token`] before the row, so a holder
/// whose lease expired mid-operation is rejected before it records anything.
/// When the row write then fails, the stock change is reversed with the same
/// token.
/// Reservation rows are keyed by `(order, product)` which makes `reserve`
/// idempotent per order line.
#[derive(Clone)]
pub struct StockService {
    products: Arc<dyn FencedRepository<Product>>,
    reservations: Arc<dyn VersionedRepository<StockReservation>>,
    lock: Arc<FencingLock>,
    lock_options: LockOptions,
}

impl StockService {
    /// Create a service.
    pub fn new(
        products: Arc<dyn FencedRepository<Product>>,
        reservations: Arc<dyn VersionedRepository<StockReservation>>,
        lock: Arc<FencingLock>,
        lock_options: LockOptions,
    ) -> Self {
        Self {
            products,
            reservations,
            lock,
            lock_options,
        }
    }

    /// Hold `quantity` units of `product_id` for `order_id`.
    ///
    /// Returns the existing row when the line is already reserved or
    /// confirmed. A released line is reserved again.
    pub async fn reserve(&self, order_id: &str, product_id: &str, quantity: u32) -> SagaResult<StockReservation> {
        if quantity == 0 {
            return Err(SagaError::InvalidOrder(format!("zero quantity for product {}", product_id)));
        }
        let key = product_key(product_id);
        let key = key.as_str();
        self.lock
            .with_fencing_token(key, &self.lock_options, |token| async move {
                let id = StockReservation::id_for(order_id, product_id);
                let existing = self.reservations.find_by_id(&id).await?;
                if let Some(reservation) = &existing {
                    if reservation.status != ReservationStatus::Released {
                        debug!(order_id = %order_id, product_id = %product_id, "already reserved");
                        return Ok(reservation.clone());
                    }
                }

                let product = self.find_product(product_id).await?;
                if product.stock < quantity {
                    return Err(SagaError::InsufficientStock {
                        product_id: product_id.to_string(),
                        requested: quantity,
                        available: product.stock,
                    });
                }

                let reservation = match existing {
                    Some(mut released) => {
                        released.quantity = quantity;
                        released.status = ReservationStatus::Reserved;
                        released.updated_at = Utc::now();
                        released
                    }
                    None => StockReservation::new(order_id, product_id, quantity),
                };
                self.adjust_stock(key, product_id, token, -i64::from(quantity)).await?;
                let reservation = match self.reservations.save(reservation).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        self.undo_adjust(key, product_id, token, i64::from(quantity)).await;
                        return Err(e);
                    }
                };
                metrics::counter!("plexspaces_stock_reserved_units_total").increment(u64::from(quantity));
                info!(order_id = %order_id, product_id = %product_id, quantity, fencing_token = token, "stock reserved");
                Ok(reservation)
            })
            .await
    }

    /// Mark every `RESERVED` line of `order_id` as `CONFIRMED`. Returns the
    /// number of lines changed.
    pub async fn confirm(&self, order_id: &str) -> SagaResult<usize> {
        let mut confirmed = 0;
        for reservation in self.reservations_for(order_id).await? {
            if reservation.status != ReservationStatus::Reserved {
                continue;
            }
            let reservation_id = reservation.id.as_str();
            let changed = self
                .lock
                .with_lock(&product_key(&reservation.product_id), &self.lock_options, |_lease| async move {
                    match self.reservations.find_by_id(reservation_id).await? {
                        Some(mut r) if r.status == ReservationStatus::Reserved => {
                            r.status = ReservationStatus::Confirmed;
                            r.updated_at = Utc::now();
                            self.reservations.save(r).await?;
                            Ok::<_, SagaError>(true)
                        }
                        _ => Ok(false),
                    }
                })
                .await?;
            if changed {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    /// Return the stock of every unreleased line of `order_id` to its
    /// product. Returns the number of lines released; 0 when nothing was
    /// left to release.
    pub async fn release_for_order(&self, order_id: &str) -> SagaResult<usize> {
        let mut released = 0;
        for reservation in self.reservations_for(order_id).await? {
            if reservation.status == ReservationStatus::Released {
                continue;
            }
            if self.release_line(&reservation.id, &reservation.product_id).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Units on hand.
    pub async fn available(&self, product_id: &str) -> SagaResult<u32> {
        Ok(self.find_product(product_id).await?.stock)
    }

    /// Reservation rows of `order_id`.
    pub async fn reservations_for(&self, order_id: &str) -> SagaResult<Vec<StockReservation>> {
        let mut rows: Vec<StockReservation> = self
            .reservations
            .find_all()
            .await?
            .into_iter()
            .filter(|r| r.order_id == order_id)
            .collect();
        rows.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(rows)
    }

    async fn release_line(&self, reservation_id: &str, product_id: &str) -> SagaResult<bool> {
        let key = product_key(product_id);
        let key = key.as_str();
        self.lock
            .with_fencing_token(key, &self.lock_options, |token| async move {
                // re-read under the lock; a concurrent release may have won
                let mut reservation = match self.reservations.find_by_id(reservation_id).await? {
                    Some(r) if r.status != ReservationStatus::Released => r,
                    _ => return Ok(false),
                };
                let quantity = reservation.quantity;
                self.adjust_stock(key, product_id, token, i64::from(quantity)).await?;
                reservation.status = ReservationStatus::Released;
                reservation.updated_at = Utc::now();
                if let Err(e) = self.reservations.save(reservation).await {
                    self.undo_adjust(key, product_id, token, -i64::from(quantity)).await;
                    return Err(e);
                }
                info!(reservation_id = %reservation_id, product_id = %product_id, quantity, "stock released");
                Ok(true)
            })
            .await
    }

    async fn adjust_stock(&self, key: &str, product_id: &str, token: i64, delta: i64) -> SagaResult<()> {
        let accepted = self
            .products
            .update_with_fencing_token(
                product_id,
                token,
                Box::new(move |product: &mut Product| {
                    let stock = (i64::from(product.stock) + delta).clamp(0, i64::from(u32::MAX));
                    product.stock = stock as u32;
                    product.updated_at = Utc::now();
                }),
            )
            .await?;
        if accepted {
            return Ok(());
        }
        let current = self.find_product(product_id).await?.last_fencing_token;
        metrics::counter!("plexspaces_lock_fencing_violations_total").increment(1);
        Err(LockError::FencingTokenViolation {
            key: key.to_string(),
            issued: token,
            current,
        }
        .into())
    }

    /// Reverse a stock change whose reservation row could not be written.
    /// Runs under the same lease and token as the change itself.
    async fn undo_adjust(&self, key: &str, product_id: &str, token: i64, delta: i64) {
        match self.adjust_stock(key, product_id, token, delta).await {
            Ok(()) => warn!(product_id = %product_id, delta, fencing_token = token, "stock change undone"),
            Err(e) => error!(product_id = %product_id, delta, fencing_token = token, error = %e, "failed to undo stock change"),
        }
    }

    async fn find_product(&self, product_id: &str) -> SagaResult<Product> {
        self.products
            .find_by_id(product_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Product", product_id))
    }
}

fn product_key(product_id: &str) -> String {
    format!("product:{}", product_id)
}
