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

//! Optimistic-retry wrapper.
//!
//! A lock-free alternative for single-aggregate mutations: run the operation,
//! and when it fails with a version conflict wait a fixed delay and run it
//! again, up to a bounded number of attempts. Any other error, or the last
//! conflict once attempts are exhausted, is returned unchanged.

use crate::LockError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry bounds for [`with_optimistic_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Policy with explicit bounds.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

/// Errors that can report an optimistic version conflict.
pub trait RetryableError {
    /// `true` when the failure is a version conflict worth retrying.
    fn is_version_conflict(&self) -> bool;
}

impl RetryableError for LockError {
    fn is_version_conflict(&self) -> bool {
        LockError::is_version_conflict(self)
    }
}

/// Run `operation`, retrying on version conflicts per `policy`.
///
/// ## Examples
/// ```rust
/// use plexspaces_locks::{with_optimistic_retry, LockError, RetryPolicy};
///
/// # async fn example() -> Result<(), LockError> {
/// let value = with_optimistic_retry(&RetryPolicy::default(), "read-modify-write", || async {
///     Ok::<_, LockError>(7)
/// })
/// .await?;
/// assert_eq!(value, 7);
/// # Ok(())
/// # }
/// ```
pub async fn with_optimistic_retry<T, E, F, Fut>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_version_conflict() && attempt < max_attempts => {
                metrics::counter!("plexspaces_optimistic_retries_total").increment(1);
                debug!(operation = %operation_name, attempt, error = %e, "version conflict, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_version_conflict() {
                    warn!(operation = %operation_name, attempts = attempt, "optimistic retries exhausted");
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
