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

//! # PlexSpaces lock kit
//!
//! Store-assisted distributed locks, an optimistic-retry wrapper and an order
//! saga with compensation, re-exported from the workspace crates:
//!
//! - [`store`]: the [`LockStore`](store::LockStore) contract, atomic scripts,
//!   in-memory and Redis backends
//! - [`locks`]: spin, pub/sub, queue, fencing and quorum locks behind
//!   [`DistributedLock`]
//! - [`saga`]: versioned aggregates, business services, [`OrderSaga`] and
//!   [`RecoverySweep`]
//!
//! ## Examples
//!
//! ```rust
//! use plexspaces::{build_lock, LockOptions, LockStrategy, WithLock};
//! use plexspaces::store::{InMemoryStore, LockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), plexspaces::LockError> {
//! let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
//! let lock = build_lock(LockStrategy::Fencing, store);
//! let token = lock
//!     .with_lock("product:42", &LockOptions::default(), |lease| async move {
//!         Ok::<_, plexspaces::LockError>(lease.fencing_token)
//!     })
//!     .await?;
//! assert_eq!(token, Some(1));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use plexspaces_locks as locks;
pub use plexspaces_saga as saga;
pub use plexspaces_store as store;

pub mod tracing_setup;

pub use locks::{
    build_lock, with_optimistic_retry, DistributedLock, FencingLock, LockError, LockLease, LockOptions, LockResult,
    LockStrategy, PubSubLock, QueueLock, QuorumLock, RetryPolicy, SpinLock, WithLock,
};
pub use saga::{OrderSaga, RecoverySweep, SagaConfig, SagaError, SagaResult};
pub use tracing_setup::init_tracing;
