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

//! Versioned business aggregates touched by the order saga.
//!
//! Every aggregate carries an integer `version`. A repository save succeeds
//! only when the stored version equals the version the writer read, and then
//! increments it by one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A durable entity with optimistic versioning.
pub trait Aggregate: Clone + Send + Sync + 'static {
    /// Type name used in errors and metrics.
    const ENTITY: &'static str;

    /// Unique id.
    fn id(&self) -> &str;

    /// Version last read from (or written to) the repository; 0 when new.
    fn version(&self) -> u64;

    /// Set by the repository on a successful save.
    fn set_version(&mut self, version: u64);
}

/// An aggregate that also records the last fencing token that wrote it.
pub trait FencedAggregate: Aggregate {
    /// Highest fencing token accepted so far.
    fn last_fencing_token(&self) -> Option<i64>;

    /// Advance the accepted token.
    fn set_last_fencing_token(&mut self, token: i64);
}

macro_rules! versioned {
    ($ty:ty, $entity:literal) => {
        impl Aggregate for $ty {
            const ENTITY: &'static str = $entity;

            fn id(&self) -> &str {
                &self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

/// Sellable product with on-hand stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Product id
    pub id: String,
    /// Display name
    pub name: String,
    /// Unit price in minor currency units
    pub price: i64,
    /// Units available to reserve
    pub stock: u32,
    /// Optimistic version
    pub version: u64,
    /// Last fencing token accepted for a stock write
    pub last_fencing_token: Option<i64>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// New product, not yet saved.
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: i64, stock: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            stock,
            version: 0,
            last_fencing_token: None,
            updated_at: Utc::now(),
        }
    }
}

versioned!(Product, "Product");

impl FencedAggregate for Product {
    fn last_fencing_token(&self) -> Option<i64> {
        self.last_fencing_token
    }

    fn set_last_fencing_token(&mut self, token: i64) {
        self.last_fencing_token = Some(token);
    }
}

/// Lifecycle of a stock reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Stock held for a pending order
    Reserved,
    /// Order completed; stock consumed
    Confirmed,
    /// Stock returned to the product
    Released,
}

/// Units of one product held for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservation {
    /// `{order_id}:{product_id}`
    pub id: String,
    /// Owning order
    pub order_id: String,
    /// Reserved product
    pub product_id: String,
    /// Units held
    pub quantity: u32,
    /// Current status
    pub status: ReservationStatus,
    /// Optimistic version
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl StockReservation {
    /// Reservation id for an (order, product) pair.
    pub fn id_for(order_id: &str, product_id: &str) -> String {
        format!("{}:{}", order_id, product_id)
    }

    /// New `RESERVED` row.
    pub fn new(order_id: &str, product_id: &str, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(order_id, product_id),
            order_id: order_id.to_string(),
            product_id: product_id.to_string(),
            quantity,
            status: ReservationStatus::Reserved,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

versioned!(StockReservation, "StockReservation");

/// Coupon definition with a fixed issue quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    /// Coupon id
    pub id: String,
    /// Display name
    pub name: String,
    /// Flat discount in minor currency units
    pub discount_amount: i64,
    /// Maximum number of user coupons
    pub total_quantity: u32,
    /// User coupons issued so far
    pub issued_quantity: u32,
    /// Optimistic version
    pub version: u64,
}

impl Coupon {
    /// New coupon with nothing issued.
    pub fn new(id: impl Into<String>, name: impl Into<String>, discount_amount: i64, total_quantity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            discount_amount,
            total_quantity,
            issued_quantity: 0,
            version: 0,
        }
    }

    /// Quota left.
    pub fn remaining(&self) -> u32 {
        self.total_quantity.saturating_sub(self.issued_quantity)
    }
}

versioned!(Coupon, "Coupon");

/// State of a coupon held by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserCouponStatus {
    /// Issued, not yet used
    Available,
    /// Applied to an order
    Used,
    /// Past its validity
    Expired,
}

/// A coupon issued to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCoupon {
    /// User coupon id
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Coupon definition
    pub coupon_id: String,
    /// Current status
    pub status: UserCouponStatus,
    /// Order the coupon was applied to
    pub used_order_id: Option<String>,
    /// Optimistic version
    pub version: u64,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Use time
    pub used_at: Option<DateTime<Utc>>,
}

versioned!(UserCoupon, "UserCoupon");

/// A user's point wallet. The id is the user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBalance {
    /// User id
    pub id: String,
    /// Points available
    pub balance: i64,
    /// Optimistic version
    pub version: u64,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl PointBalance {
    /// New wallet.
    pub fn new(user_id: impl Into<String>, balance: i64) -> Self {
        Self {
            id: user_id.into(),
            balance,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

versioned!(PointBalance, "PointBalance");

/// Direction of a point movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointTransactionKind {
    /// Debit for an order
    Use,
    /// Credit reversing a debit
    Refund,
}

/// Point movement tied to an order. At most one of each kind per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTransaction {
    /// `{order_id}:{kind}`
    pub id: String,
    /// User id
    pub user_id: String,
    /// Order id
    pub order_id: String,
    /// Debit or credit
    pub kind: PointTransactionKind,
    /// Points moved (positive)
    pub amount: i64,
    /// Optimistic version
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl PointTransaction {
    /// Transaction id for an (order, kind) pair.
    pub fn id_for(order_id: &str, kind: PointTransactionKind) -> String {
        match kind {
            PointTransactionKind::Use => format!("{}:use", order_id),
            PointTransactionKind::Refund => format!("{}:refund", order_id),
        }
    }
}

versioned!(PointTransaction, "PointTransaction");

/// Order lifecycle. Any status may move to any other through the
/// status-change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created, saga in flight
    Pending,
    /// Saga completed
    Success,
    /// Saga compensated
    Failed,
    /// Cancelled by the user or an administrator
    Cancelled,
}

impl OrderStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "SUCCESS" => Ok(OrderStatus::Success),
            "FAILED" => Ok(OrderStatus::Failed),
            "CANCELLED" | "CANCELED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product id
    pub product_id: String,
    /// Units ordered
    pub quantity: u32,
    /// Unit price at order time
    pub unit_price: i64,
}

impl OrderItem {
    /// Line total.
    pub fn subtotal(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

/// A placed order. Orders are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id (ULID)
    pub id: String,
    /// Buyer
    pub user_id: String,
    /// Lines
    pub items: Vec<OrderItem>,
    /// Coupon applied, if any
    pub user_coupon_id: Option<String>,
    /// Points to debit
    pub points_used: i64,
    /// Sum of line totals
    pub total_amount: i64,
    /// Coupon discount applied
    pub discount_amount: i64,
    /// Current status
    pub status: OrderStatus,
    /// Optimistic version
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status change
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Amount charged after discount and points.
    pub fn payable_amount(&self) -> i64 {
        (self.total_amount - self.discount_amount - self.points_used).max(0)
    }
}

versioned!(Order, "Order");
