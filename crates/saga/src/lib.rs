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

//! # PlexSpaces Order Saga
//!
//! ## Purpose
//! Keeps stock, coupon quota, point balances, order status and the
//! popularity ranking consistent when an order touches all of them and no
//! single transaction spans them.
//!
//! ## Components
//! - [`services`]: one service per resource, each guarded by a lock or by
//!   optimistic versioning
//! - [`OrderSaga`]: prepare, process, and compensate on failure
//! - [`RecoverySweep`]: periodically re-drives compensation for `FAILED` and
//!   stale `PENDING` orders
//!
//! ## Examples
//!
//! ```rust
//! use plexspaces_saga::model::{OrderItem, Product};
//! use plexspaces_saga::services::NewOrder;
//! use plexspaces_saga::{InMemoryRepositories, OrderSaga, SagaConfig, VersionedRepository};
//! use plexspaces_store::{InMemoryStore, LockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), plexspaces_saga::SagaError> {
//! let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
//! let repositories = InMemoryRepositories::new();
//! repositories.products.save(Product::new("p1", "mug", 1_200, 10)).await?;
//!
//! let saga = OrderSaga::wire(store, &repositories, SagaConfig::default());
//! let order = saga
//!     .place_order(&NewOrder {
//!         user_id: "u1".to_string(),
//!         items: vec![OrderItem { product_id: "p1".to_string(), quantity: 2, unit_price: 1_200 }],
//!         user_coupon_id: None,
//!         points: 0,
//!     })
//!     .await?;
//! assert_eq!(saga.stock().available("p1").await?, 8);
//! # let _ = order;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod model;
pub mod recovery;
pub mod repository;
pub mod saga;
pub mod services;

pub use config::SagaConfig;
pub use error::{SagaError, SagaResult};
pub use model::{Order, OrderItem, OrderStatus};
pub use recovery::{RecoveryReport, RecoverySweep};
pub use repository::{FencedRepository, InMemoryRepositories, InMemoryRepository, Patch, VersionedRepository};
pub use saga::{Compensation, OrderSaga, Recovery};
pub use services::NewOrder;
