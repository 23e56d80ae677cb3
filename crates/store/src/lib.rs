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

//! # PlexSpaces Store
//!
//! ## Purpose
//! Thin client over the shared key-value store that every lock strategy in
//! `plexspaces-locks` is built on. It offers exactly the primitives the locks
//! need and nothing else:
//!
//! - SET-if-absent with TTL, plain GET/SET/DEL and PTTL
//! - increment-with-expire counters
//! - list push/pop (FIFO waiter queues)
//! - sorted-set operations (popularity ranking)
//! - atomic multi-step scripts ([`scripts`])
//! - publish/subscribe channels (release notifications)
//!
//! ## Backend Support
//!
//! - **InMemory**: single-process, always available, used by tests (feature: `memory-backend`)
//! - **Redis**: distributed with native TTL, Lua and pub/sub (feature: `redis-backend`)
//!
//! ## Examples
//! ```rust
//! use plexspaces_store::{AtomicScripts, InMemoryStore};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//!
//! assert!(store.try_acquire("order:1", "token-a", Duration::from_secs(5)).await?);
//! assert!(!store.try_acquire("order:1", "token-b", Duration::from_secs(5)).await?);
//!
//! // Only the holder's token deletes the record
//! assert!(!store.compare_and_delete("order:1", "token-b").await?);
//! assert!(store.compare_and_delete("order:1", "token-a").await?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod scripts;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use config::{create_store_from_config, create_store_from_env, BackendType, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use scripts::{AtomicScripts, QueueEntry, ReleaseOutcome, ScriptCall, ScriptKind, ScriptValue};

#[cfg(feature = "memory-backend")]
pub use memory::InMemoryStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStore;

/// Stream of message payloads received on a subscribed channel.
///
/// Dropping the stream unsubscribes.
pub type Subscription = BoxStream<'static, String>;

/// Store operations required by the lock strategies.
///
/// ## Design Decisions
/// - **String values**: lock tokens, counters and queue entries are all text
/// - **TTL on write**: every ephemeral record is written with its lease
/// - **Scripts as data**: multi-step atomics go through [`LockStore::eval`]
///   with a [`ScriptCall`] so each backend decides how to run them atomically
/// - **Subscribe returns a stream**: callers race it against timers with
///   `tokio::select!`
#[async_trait]
pub trait LockStore: Send + Sync {
    // =========================================================================
    // Strings
    // =========================================================================

    /// Get value by key.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set value without TTL (overwrites).
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Set value with TTL (overwrites).
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// SET NX PX: write only when the key is absent.
    ///
    /// ## Returns
    /// - `Ok(true)` if the value was written
    /// - `Ok(false)` if the key already exists
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete key; `true` if something was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Check if key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining TTL; `None` when the key is absent or has no expiry.
    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    // =========================================================================
    // Counters
    // =========================================================================

    /// Atomically increment an integer counter and refresh its TTL, returning
    /// the new value. An absent key starts from 0.
    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    // =========================================================================
    // Lists
    // =========================================================================

    /// Append to the tail of a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Pop from the head of a list.
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Inclusive range with Redis index semantics (negative counts from the tail).
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    /// List length (0 when absent).
    async fn llen(&self, key: &str) -> StoreResult<usize>;

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// Add `delta` to a member's score, returning the new score.
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;

    /// Score of a member.
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members ordered by descending score, inclusive rank range.
    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>>;

    /// Remove a member; `true` if it existed.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    // =========================================================================
    // Scripts and pub/sub
    // =========================================================================

    /// Execute an atomic script.
    async fn eval(&self, call: &ScriptCall) -> StoreResult<ScriptValue>;

    /// Publish a message; returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Subscribe to a channel. Messages published after this call returns are
    /// delivered on the stream.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Backend name for diagnostics.
    fn backend_name(&self) -> &'static str;
}

/// Resolve Redis-style inclusive `[start, stop]` indices against `len`.
///
/// Returns `None` for an empty range.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}
