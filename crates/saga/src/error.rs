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

//! Error types for the order saga and its business services.

use plexspaces_locks::{LockError, RetryableError};
use plexspaces_store::StoreError;
use thiserror::Error;

/// Result type for saga and service operations.
pub type SagaResult<T> = Result<T, SagaError>;

/// Errors raised by business services and the saga orchestrator.
///
/// Lock and version conflicts arrive as [`SagaError::Lock`]; everything else
/// is either a business-rule violation or a store failure. Use
/// [`SagaError::is_transient`] to tell a retryable conflict from a rejection.
#[derive(Error, Debug)]
pub enum SagaError {
    /// Lock timeout, fencing violation or optimistic version conflict
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Store failure outside a lock operation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Aggregate not found
    #[error("{entity} {id} not found")]
    NotFound {
        /// Aggregate type
        entity: &'static str,
        /// Aggregate id
        id: String,
    },

    /// Product stock below the requested quantity
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product id
        product_id: String,
        /// Quantity requested
        requested: u32,
        /// Quantity on hand
        available: u32,
    },

    /// Coupon has no quota left
    #[error("Coupon {coupon_id} quota exhausted")]
    QuotaExhausted {
        /// Coupon id
        coupon_id: String,
    },

    /// User coupon cannot be used (wrong owner, already used, expired)
    #[error("User coupon {user_coupon_id} not available: {reason}")]
    CouponNotAvailable {
        /// User coupon id
        user_coupon_id: String,
        /// Why it was rejected
        reason: String,
    },

    /// Point balance below the requested amount
    #[error("Insufficient points for user {user_id}: requested {requested}, available {available}")]
    InsufficientPoints {
        /// User id
        user_id: String,
        /// Points requested
        requested: i64,
        /// Current balance
        available: i64,
    },

    /// No point-use transaction exists for the order
    #[error("No point transaction for order {order_id}")]
    TransactionNotFound {
        /// Order id
        order_id: String,
    },

    /// Order request rejected before any state change
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Operation not allowed in the order's current status
    #[error("Order {order_id} is {status}; cannot {action}")]
    InvalidState {
        /// Order id
        order_id: String,
        /// Current status
        status: String,
        /// Attempted action
        action: &'static str,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SagaError {
    /// `true` for lock timeouts and version conflicts, which a client may
    /// retry; `false` for business-rule violations and hard failures.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Lock(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Shorthand for a version conflict on `entity`.
    pub fn conflict(entity: &str, id: &str, expected: u64, actual: u64) -> Self {
        SagaError::Lock(LockError::OptimisticLock {
            entity: entity.to_string(),
            id: id.to_string(),
            expected,
            actual,
        })
    }

    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        SagaError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl RetryableError for SagaError {
    fn is_version_conflict(&self) -> bool {
        matches!(self, SagaError::Lock(e) if e.is_version_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_vs_business() {
        let timeout = SagaError::from(LockError::Timeout {
            key: "coupon:1".to_string(),
            attempts: 10,
            elapsed_ms: 100,
        });
        let conflict = SagaError::conflict("Order", "o1", 1, 2);
        let stock = SagaError::InsufficientStock {
            product_id: "p1".to_string(),
            requested: 3,
            available: 1,
        };
        let fencing = SagaError::from(LockError::FencingTokenViolation {
            key: "product:p1".to_string(),
            issued: 3,
            current: Some(4),
        });

        assert!(timeout.is_transient());
        assert!(conflict.is_transient());
        assert!(!stock.is_transient());
        assert!(!fencing.is_transient());
        assert!(!SagaError::Store(StoreError::BackendError("down".to_string())).is_transient());
    }

    #[test]
    fn test_only_version_conflicts_retry() {
        assert!(SagaError::conflict("Coupon", "c1", 0, 1).is_version_conflict());
        assert!(!SagaError::from(LockError::InvalidKey(String::new())).is_version_conflict());
        assert!(!SagaError::TransactionNotFound {
            order_id: "o1".to_string()
        }
        .is_version_conflict());
    }
}
