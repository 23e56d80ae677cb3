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

//! Coupon issuance and use.

use crate::model::{Coupon, UserCoupon, UserCouponStatus};
use crate::repository::VersionedRepository;
use crate::{SagaError, SagaResult};
use chrono::Utc;
use plexspaces_locks::{with_optimistic_retry, DistributedLock, LockOptions, RetryPolicy, WithLock};
use std::sync::Arc;
use tracing::{debug, info};
use ulid::Ulid;

/// Issues user coupons against a quota and tracks their use.
///
/// Issuance runs under a lock on `coupon:{id}` so that concurrent requests
/// never issue more than `total_quantity`. Use and restore are single-row
/// versioned writes retried on conflict.
#[derive(Clone)]
pub struct CouponService {
    coupons: Arc<dyn VersionedRepository<Coupon>>,
    user_coupons: Arc<dyn VersionedRepository<UserCoupon>>,
    lock: Arc<dyn DistributedLock>,
    lock_options: LockOptions,
    retry: RetryPolicy,
}

impl CouponService {
    /// Create a service.
    pub fn new(
        coupons: Arc<dyn VersionedRepository<Coupon>>,
        user_coupons: Arc<dyn VersionedRepository<UserCoupon>>,
        lock: Arc<dyn DistributedLock>,
        lock_options: LockOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            coupons,
            user_coupons,
            lock,
            lock_options,
            retry,
        }
    }

    /// Issue one coupon to `user_id`, failing with
    /// [`SagaError::QuotaExhausted`] once the quota is used up.
    pub async fn issue(&self, coupon_id: &str, user_id: &str) -> SagaResult<UserCoupon> {
        let key = format!("coupon:{}", coupon_id);
        self.lock
            .with_lock(&key, &self.lock_options, |_lease| async move {
                let mut coupon = self
                    .coupons
                    .find_by_id(coupon_id)
                    .await?
                    .ok_or_else(|| SagaError::not_found("Coupon", coupon_id))?;
                if coupon.remaining() == 0 {
                    metrics::counter!("plexspaces_coupon_quota_exhausted_total").increment(1);
                    return Err(SagaError::QuotaExhausted {
                        coupon_id: coupon_id.to_string(),
                    });
                }
                coupon.issued_quantity += 1;
                let coupon = self.coupons.save(coupon).await?;

                let user_coupon = self
                    .user_coupons
                    .save(UserCoupon {
                        id: Ulid::new().to_string(),
                        user_id: user_id.to_string(),
                        coupon_id: coupon_id.to_string(),
                        status: UserCouponStatus::Available,
                        used_order_id: None,
                        version: 0,
                        issued_at: Utc::now(),
                        used_at: None,
                    })
                    .await?;
                info!(coupon_id = %coupon_id, user_id = %user_id, remaining = coupon.remaining(), "coupon issued");
                Ok(user_coupon)
            })
            .await
    }

    /// Check that `user_coupon_id` belongs to `user_id` and is available.
    /// Returns the coupon's discount.
    pub async fn validate(&self, user_coupon_id: &str, user_id: &str) -> SagaResult<i64> {
        let user_coupon = self.find_user_coupon(user_coupon_id).await?;
        if user_coupon.user_id != user_id {
            return Err(not_available(user_coupon_id, "belongs to another user"));
        }
        if user_coupon.status != UserCouponStatus::Available {
            return Err(not_available(user_coupon_id, &format!("status is {:?}", user_coupon.status)));
        }
        let coupon = self
            .coupons
            .find_by_id(&user_coupon.coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Coupon", &user_coupon.coupon_id))?;
        Ok(coupon.discount_amount)
    }

    /// Mark the coupon used by `order_id`. Idempotent for the same order.
    pub async fn use_coupon(&self, user_coupon_id: &str, order_id: &str) -> SagaResult<UserCoupon> {
        with_optimistic_retry(&self.retry, "coupon.use", || async move {
            let mut user_coupon = self.find_user_coupon(user_coupon_id).await?;
            match user_coupon.status {
                UserCouponStatus::Used if user_coupon.used_order_id.as_deref() == Some(order_id) => {
                    return Ok(user_coupon);
                }
                UserCouponStatus::Available => {}
                status => return Err(not_available(user_coupon_id, &format!("status is {:?}", status))),
            }
            user_coupon.status = UserCouponStatus::Used;
            user_coupon.used_order_id = Some(order_id.to_string());
            user_coupon.used_at = Some(Utc::now());
            self.user_coupons.save(user_coupon).await
        })
        .await
    }

    /// Return a coupon used by `order_id` to `AVAILABLE`. Returns `false`
    /// when the coupon is not in use by that order (already restored).
    pub async fn restore(&self, user_coupon_id: &str, order_id: &str) -> SagaResult<bool> {
        with_optimistic_retry(&self.retry, "coupon.restore", || async move {
            let mut user_coupon = self.find_user_coupon(user_coupon_id).await?;
            if user_coupon.status != UserCouponStatus::Used || user_coupon.used_order_id.as_deref() != Some(order_id) {
                debug!(user_coupon_id = %user_coupon_id, order_id = %order_id, "coupon not in use by order");
                return Ok(false);
            }
            user_coupon.status = UserCouponStatus::Available;
            user_coupon.used_order_id = None;
            user_coupon.used_at = None;
            self.user_coupons.save(user_coupon).await?;
            Ok(true)
        })
        .await
    }

    /// Look up a user coupon.
    pub async fn find_user_coupon(&self, user_coupon_id: &str) -> SagaResult<UserCoupon> {
        self.user_coupons
            .find_by_id(user_coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("UserCoupon", user_coupon_id))
    }
}

fn not_available(user_coupon_id: &str, reason: &str) -> SagaError {
    SagaError::CouponNotAvailable {
        user_coupon_id: user_coupon_id.to_string(),
        reason: reason.to_string(),
    }
}
