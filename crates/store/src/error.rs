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

//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the shared store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation against a key holding the wrong kind of value
    #[error("Wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// Script invoked with missing or malformed keys/arguments
    #[error("Invalid script argument for {script}: {reason}")]
    InvalidArgument { script: &'static str, reason: String },

    /// Script returned a value its parser does not understand
    #[error("Unexpected reply from {script}: {reply}")]
    UnexpectedReply { script: &'static str, reply: String },

    /// Subscription could not be established or was dropped
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend error (network, protocol, server-side script failure)
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::BackendError(format!("Redis error: {}", err))
        }
    }
}
