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

//! # PlexSpaces Distributed Locks
//!
//! ## Purpose
//! Mutual-exclusion primitives built over a shared [`LockStore`], plus an
//! optimistic-retry wrapper for lock-free single-aggregate updates.
//!
//! ## Strategies
//!
//! | Strategy | Waiting | Ordering | Extra |
//! |---|---|---|---|
//! | [`SpinLock`] | backoff polling | none | |
//! | [`PubSubLock`] | release notification + 10ms poll | none | |
//! | [`QueueLock`] | FIFO list, addressed wake-ups | FIFO | |
//! | [`FencingLock`] | as pub/sub | none | monotonic fencing token |
//! | [`QuorumLock`] | jittered retries | none | majority over N stores |
//!
//! All share [`LockOptions`] `{ttl, timeout, max_attempts, initial_delay,
//! max_delay}` and the [`DistributedLock`] contract; [`WithLock::with_lock`]
//! runs a critical section and releases on every exit path.
//!
//! ## Design Decisions
//! - **Holder tokens**: every acquisition writes a unique token and releases
//!   by compare-and-delete, so an expired holder never deletes a successor's lock
//! - **Atomic scripts**: multi-step release paths run as one store script
//! - **Not reentrant**: nested `with_lock` on the same key waits on itself
//! - **One strategy per key**: strategies share the lock record but not their
//!   waiting protocol
//!
//! ## Examples
//!
//! ```rust
//! use plexspaces_locks::{build_lock, LockError, LockOptions, LockStrategy, WithLock};
//! use plexspaces_store::{InMemoryStore, LockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), LockError> {
//! let store: Arc<dyn LockStore> = Arc::new(InMemoryStore::new());
//! let lock = build_lock(LockStrategy::Queue, store);
//!
//! let remaining = lock
//!     .with_lock("coupon:summer", &LockOptions::default(), |_lease| async move {
//!         // read quota, decrement, save
//!         Ok::<_, LockError>(99)
//!     })
//!     .await?;
//! assert_eq!(remaining, 99);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fencing;
pub mod keys;
pub mod manager;
pub mod options;
pub mod pubsub;
pub mod queue;
pub mod quorum;
pub mod retry;
pub mod spin;

pub use error::{LockError, LockResult};
pub use fencing::FencingLock;
pub use keys::LockKeys;
pub use manager::{build_lock, new_holder_token, DistributedLock, LockLease, LockStrategy, WithLock};
pub use options::{Backoff, LockOptions};
pub use pubsub::PubSubLock;
pub use queue::QueueLock;
pub use quorum::{QuorumConfig, QuorumLock};
pub use retry::{with_optimistic_retry, RetryPolicy, RetryableError};
pub use spin::SpinLock;

pub use plexspaces_store::LockStore;
