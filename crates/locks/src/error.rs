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

//! Error types for distributed lock operations.

use plexspaces_store::StoreError;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock not obtained within the timeout / attempt bounds
    #[error("Timed out acquiring lock {key} after {attempts} attempts in {elapsed_ms}ms")]
    Timeout {
        /// Lock key
        key: String,
        /// Acquisition attempts made
        attempts: u32,
        /// Time spent waiting
        elapsed_ms: u64,
    },

    /// The fencing token no longer matches the current token for the key
    #[error("Fencing token violation on {key}: issued {issued}, current {current:?}")]
    FencingTokenViolation {
        /// Lock key
        key: String,
        /// Token issued to this holder
        issued: i64,
        /// Token currently stored for the key
        current: Option<i64>,
    },

    /// Version mismatch on save (optimistic locking failure)
    #[error("Optimistic lock conflict on {entity} {id}: expected version {expected}, found {actual}")]
    OptimisticLock {
        /// Aggregate type
        entity: String,
        /// Aggregate id
        id: String,
        /// Version the writer read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Invalid lock key
    #[error("Invalid lock key: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Store error (network, script failure, wrong type)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// `true` for contention errors a caller may retry
    /// (`Timeout`, `OptimisticLock`).
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::Timeout { .. } | LockError::OptimisticLock { .. })
    }

    /// `true` when the error is a version conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, LockError::OptimisticLock { .. })
    }
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        LockError::Store(StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = LockError::Timeout {
            key: "k".to_string(),
            attempts: 3,
            elapsed_ms: 10,
        };
        let conflict = LockError::OptimisticLock {
            entity: "Coupon".to_string(),
            id: "c1".to_string(),
            expected: 1,
            actual: 2,
        };
        let fencing = LockError::FencingTokenViolation {
            key: "k".to_string(),
            issued: 1,
            current: Some(2),
        };

        assert!(timeout.is_transient());
        assert!(conflict.is_transient());
        assert!(conflict.is_version_conflict());
        assert!(!fencing.is_transient());
        assert!(!LockError::InvalidKey(String::new()).is_transient());
    }

    #[test]
    fn test_store_error_converts() {
        let err: LockError = StoreError::BackendError("boom".to_string()).into();
        assert!(matches!(err, LockError::Store(_)));
        assert_eq!(err.to_string(), "Store error: Backend error: boom");
    }
}
