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

//! Configuration support for lock store backends.
//!
//! ## Environment Variables
//!
//! ### Backend Selection
//! - `PLEXSPACES_STORE_BACKEND`: Backend type (default: "in-memory")
//!   - "in-memory" | "memory" → InMemoryStore
//!   - "redis" → RedisStore
//!
//! ### Redis Configuration
//! - `PLEXSPACES_STORE_REDIS_URL`: Redis server URL (default: "redis://localhost:6379")
//! - `PLEXSPACES_STORE_REDIS_NAMESPACE`: Key prefix for isolation (default: "plexspaces")
//!
//! ## Examples
//!
//! ### Redis
//! ```bash
//! export PLEXSPACES_STORE_BACKEND=redis
//! export PLEXSPACES_STORE_REDIS_URL=redis://localhost:6379
//! export PLEXSPACES_STORE_REDIS_NAMESPACE=orders
//! cargo run
//! ```

use crate::{LockStore, StoreError, StoreResult};
use std::sync::Arc;

/// Backend type configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendType {
    /// In-memory HashMap backend (default)
    #[default]
    InMemory,
    /// Redis backend (requires redis-backend feature)
    Redis {
        /// Redis server URL
        url: String,
        /// Key namespace prefix
        namespace: String,
    },
}

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: BackendType,
}

impl StoreConfig {
    /// Create configuration from environment variables.
    ///
    /// ## Examples
    /// ```rust
    /// use plexspaces_store::StoreConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = StoreConfig::from_env()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_env() -> StoreResult<Self> {
        let backend_str = std::env::var("PLEXSPACES_STORE_BACKEND")
            .unwrap_or_else(|_| "in-memory".to_string())
            .to_lowercase();

        let backend = match backend_str.as_str() {
            "in-memory" | "memory" => BackendType::InMemory,

            "redis" => {
                let url = std::env::var("PLEXSPACES_STORE_REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string());
                let namespace = std::env::var("PLEXSPACES_STORE_REDIS_NAMESPACE")
                    .unwrap_or_else(|_| "plexspaces".to_string());
                BackendType::Redis { url, namespace }
            }

            other => {
                return Err(StoreError::ConfigError(format!(
                    "Unknown backend type: {}. Valid options: in-memory, redis",
                    other
                )));
            }
        };

        Ok(Self { backend })
    }

    /// Create configuration with explicit backend.
    pub fn new(backend: BackendType) -> Self {
        Self { backend }
    }
}

/// Create a lock store from environment configuration.
pub async fn create_store_from_env() -> StoreResult<Arc<dyn LockStore>> {
    let config = StoreConfig::from_env()?;
    create_store_from_config(config).await
}

/// Create a lock store from explicit configuration.
///
/// ## Examples
/// ```rust
/// use plexspaces_store::{create_store_from_config, BackendType, StoreConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = create_store_from_config(StoreConfig::new(BackendType::InMemory)).await?;
/// assert_eq!(store.backend_name(), "InMemory");
/// # Ok(())
/// # }
/// ```
pub async fn create_store_from_config(config: StoreConfig) -> StoreResult<Arc<dyn LockStore>> {
    match config.backend {
        #[cfg(feature = "memory-backend")]
        BackendType::InMemory => Ok(Arc::new(crate::memory::InMemoryStore::new())),

        #[cfg(not(feature = "memory-backend"))]
        BackendType::InMemory => Err(StoreError::ConfigError(
            "In-memory backend requires 'memory-backend' feature".to_string(),
        )),

        #[cfg(feature = "redis-backend")]
        BackendType::Redis { url, namespace } => {
            let store = crate::redis::RedisStore::new(&url, &namespace).await?;
            Ok(Arc::new(store))
        }

        #[cfg(not(feature = "redis-backend"))]
        BackendType::Redis { .. } => Err(StoreError::ConfigError(
            "Redis backend requires 'redis-backend' feature".to_string(),
        )),
    }
}
