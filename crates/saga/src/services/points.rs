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

//! Point wallet debits and refunds.

use crate::model::{PointBalance, PointTransaction, PointTransactionKind};
use crate::repository::VersionedRepository;
use crate::{SagaError, SagaResult};
use chrono::Utc;
use plexspaces_locks::{with_optimistic_retry, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Debits and refunds point balances without locks.
///
/// Balance writes are versioned and retried on conflict. Each order has at
/// most one `USE` and one `REFUND` transaction, so both operations are
/// idempotent per order. A transaction row always exists before its balance
/// change.
#[derive(Clone)]
pub struct PointService {
    balances: Arc<dyn VersionedRepository<PointBalance>>,
    transactions: Arc<dyn VersionedRepository<PointTransaction>>,
    retry: RetryPolicy,
}

impl PointService {
    /// Create a service.
    pub fn new(
        balances: Arc<dyn VersionedRepository<PointBalance>>,
        transactions: Arc<dyn VersionedRepository<PointTransaction>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            balances,
            transactions,
            retry,
        }
    }

    /// Current balance; 0 for a user without a wallet.
    pub async fn balance(&self, user_id: &str) -> SagaResult<i64> {
        Ok(self.balances.find_by_id(user_id).await?.map(|b| b.balance).unwrap_or(0))
    }

    /// Add points to a wallet, creating it when missing.
    pub async fn charge(&self, user_id: &str, amount: i64) -> SagaResult<PointBalance> {
        if amount <= 0 {
            return Err(SagaError::InvalidOrder(format!("charge amount must be positive, got {}", amount)));
        }
        self.apply(user_id, amount, "points.charge").await
    }

    /// Fail with [`SagaError::InsufficientPoints`] unless `user_id` holds at
    /// least `amount`.
    pub async fn ensure_available(&self, user_id: &str, amount: i64) -> SagaResult<()> {
        let available = self.balance(user_id).await?;
        if available < amount {
            return Err(SagaError::InsufficientPoints {
                user_id: user_id.to_string(),
                requested: amount,
                available,
            });
        }
        Ok(())
    }

    /// Debit `amount` for `order_id`. A repeated call returns the recorded
    /// transaction without debiting again.
    ///
    /// The `USE` row is written before the debit and claims the order; it is
    /// removed again when the debit fails.
    pub async fn use_points(&self, user_id: &str, order_id: &str, amount: i64) -> SagaResult<PointTransaction> {
        if amount <= 0 {
            return Err(SagaError::InvalidOrder(format!("point amount must be positive, got {}", amount)));
        }
        if let Some(existing) = self.find_transaction(order_id, PointTransactionKind::Use).await? {
            debug!(order_id = %order_id, "points already used");
            return Ok(existing);
        }
        let claim = match self.claim(user_id, order_id, PointTransactionKind::Use, amount).await? {
            Claim::Won(claim) => claim,
            Claim::Lost(existing) => return Ok(existing),
        };
        if let Err(e) = self.apply(user_id, -amount, "points.use").await {
            self.drop_claim(&claim).await;
            return Err(e);
        }
        info!(user_id = %user_id, order_id = %order_id, amount, "points used");
        Ok(claim)
    }

    /// Credit back the points used by `order_id`.
    ///
    /// Fails with [`SagaError::TransactionNotFound`] when the order never
    /// used points; returns the existing refund when already refunded.
    pub async fn refund(&self, user_id: &str, order_id: &str) -> SagaResult<PointTransaction> {
        let used = self
            .find_transaction(order_id, PointTransactionKind::Use)
            .await?
            .ok_or_else(|| SagaError::TransactionNotFound {
                order_id: order_id.to_string(),
            })?;
        if let Some(existing) = self.find_transaction(order_id, PointTransactionKind::Refund).await? {
            debug!(order_id = %order_id, "points already refunded");
            return Ok(existing);
        }
        let claim = match self.claim(user_id, order_id, PointTransactionKind::Refund, used.amount).await? {
            Claim::Won(claim) => claim,
            Claim::Lost(existing) => return Ok(existing),
        };
        if let Err(e) = self.apply(user_id, used.amount, "points.refund").await {
            self.drop_claim(&claim).await;
            return Err(e);
        }
        info!(user_id = %user_id, order_id = %order_id, amount = used.amount, "points refunded");
        Ok(claim)
    }

    /// Transaction of `kind` for `order_id`.
    pub async fn find_transaction(
        &self,
        order_id: &str,
        kind: PointTransactionKind,
    ) -> SagaResult<Option<PointTransaction>> {
        self.transactions.find_by_id(&PointTransaction::id_for(order_id, kind)).await
    }

    async fn apply(&self, user_id: &str, delta: i64, operation: &str) -> SagaResult<PointBalance> {
        with_optimistic_retry(&self.retry, operation, || async move {
            let mut wallet = self
                .balances
                .find_by_id(user_id)
                .await?
                .unwrap_or_else(|| PointBalance::new(user_id, 0));
            if wallet.balance + delta < 0 {
                return Err(SagaError::InsufficientPoints {
                    user_id: user_id.to_string(),
                    requested: -delta,
                    available: wallet.balance,
                });
            }
            wallet.balance += delta;
            wallet.updated_at = Utc::now();
            self.balances.save(wallet).await
        })
        .await
    }

    /// Insert the transaction row for `(order_id, kind)`. Losing the insert
    /// to a concurrent call yields that call's row.
    async fn claim(
        &self,
        user_id: &str,
        order_id: &str,
        kind: PointTransactionKind,
        amount: i64,
    ) -> SagaResult<Claim> {
        let row = PointTransaction {
            id: PointTransaction::id_for(order_id, kind),
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            kind,
            amount,
            version: 0,
            created_at: Utc::now(),
        };
        match self.transactions.save(row).await {
            Ok(claimed) => Ok(Claim::Won(claimed)),
            Err(e) if e.is_transient() => match self.find_transaction(order_id, kind).await? {
                Some(existing) => Ok(Claim::Lost(existing)),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn drop_claim(&self, claim: &PointTransaction) {
        if let Err(e) = self.transactions.delete(&claim.id).await {
            error!(transaction_id = %claim.id, error = %e, "failed to remove point transaction after failed balance update");
        }
    }
}

enum Claim {
    Won(PointTransaction),
    Lost(PointTransaction),
}
