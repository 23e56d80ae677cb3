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

//! In-memory store implementation.
//!
//! ## Purpose
//! Provides a HashMap-based [`LockStore`] for tests and single-process
//! deployments. Every script runs while holding the data write lock, which
//! gives it the same all-or-nothing behavior a Lua script has on Redis.
//!
//! ## Features
//! - Strings, lists and sorted sets with per-key TTL
//! - Atomic scripts equivalent to the Lua sources in [`crate::scripts`]
//! - Pub/sub through `tokio::sync::broadcast`
//!
//! ## Limitations
//! - Not persistent (data lost on restart)
//! - Not distributed (single process only)
//! - Expired keys are removed lazily on access

use crate::scripts::{QueueEntry, ScriptCall, ScriptKind, ScriptValue};
use crate::{resolve_range, LockStore, StoreError, StoreResult, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

/// Entry in the in-memory store with optional TTL.
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn new_with_ttl(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }

    fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .and_then(|exp| exp.checked_duration_since(Instant::now()))
    }
}

type Data = HashMap<String, Entry>;
type Channels = HashMap<String, broadcast::Sender<String>>;

/// Live entry for `key`, dropping it first if it has expired.
fn entry_mut<'a>(data: &'a mut Data, key: &str) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(Entry::is_expired) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn live<'a>(data: &'a Data, key: &str) -> Option<&'a Entry> {
    data.get(key).filter(|e| !e.is_expired())
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn read_str(data: &Data, key: &str) -> StoreResult<Option<String>> {
    match live(data, key) {
        None => Ok(None),
        Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
        Some(_) => Err(wrong_type(key, "string")),
    }
}

fn list_mut<'a>(data: &'a mut Data, key: &str, create: bool) -> StoreResult<Option<&'a mut Entry>> {
    if entry_mut(data, key).is_none() {
        if !create {
            return Ok(None);
        }
        data.insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
    }
    match data.get_mut(key) {
        Some(entry) if matches!(entry.value, Value::List(_)) => Ok(Some(entry)),
        Some(_) => Err(wrong_type(key, "list")),
        None => Ok(None),
    }
}

fn pop_front(data: &mut Data, key: &str) -> StoreResult<Option<String>> {
    let popped = match list_mut(data, key, false)? {
        Some(Entry { value: Value::List(items), .. }) => items.pop_front(),
        _ => None,
    };
    // Redis removes empty lists
    if matches!(data.get(key), Some(Entry { value: Value::List(items), .. }) if items.is_empty()) {
        data.remove(key);
    }
    Ok(popped)
}

fn incr_locked(data: &mut Data, key: &str, ttl: Duration) -> StoreResult<i64> {
    let current = match read_str(data, key)? {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| StoreError::BackendError(format!("value at {} is not an integer", key)))?,
        None => 0,
    };
    let next = current
        .checked_add(1)
        .ok_or_else(|| StoreError::BackendError(format!("increment would overflow at {}", key)))?;
    data.insert(key.to_string(), Entry::new_with_ttl(Value::Str(next.to_string()), ttl));
    Ok(next)
}

fn publish_to(channels: &Channels, channel: &str, message: &str) -> usize {
    match channels.get(channel) {
        Some(sender) => sender.send(message.to_string()).unwrap_or(0),
        None => 0,
    }
}

fn millis_arg(call: &ScriptCall, index: usize) -> StoreResult<Duration> {
    let ms = call.int_arg(index)?;
    if ms <= 0 {
        return Err(StoreError::InvalidArgument {
            script: call.kind.name(),
            reason: format!("ttl must be positive, got {}", ms),
        });
    }
    Ok(Duration::from_millis(ms as u64))
}

/// In-memory lock store.
///
/// ## Example
/// ```rust
/// use plexspaces_store::{InMemoryStore, LockStore};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
/// assert!(store.set_nx_px("lock", "a", Duration::from_secs(1)).await?);
/// assert!(!store.set_nx_px("lock", "b", Duration::from_secs(1)).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    data: Arc<RwLock<Data>>,
    channels: Arc<RwLock<Channels>>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn eval_locked(data: &mut Data, channels: &Channels, call: &ScriptCall) -> StoreResult<ScriptValue> {
        match call.kind {
            ScriptKind::Acquire => {
                let key = call.key(0)?;
                let token = call.arg(0)?;
                let ttl = millis_arg(call, 1)?;
                if entry_mut(data, key).is_some() {
                    return Ok(ScriptValue::Int(0));
                }
                data.insert(key.to_string(), Entry::new_with_ttl(Value::Str(token.to_string()), ttl));
                Ok(ScriptValue::Int(1))
            }

            ScriptKind::Release => {
                let key = call.key(0)?;
                let token = call.arg(0)?;
                if read_str(data, key)?.as_deref() == Some(token) {
                    data.remove(key);
                    return Ok(ScriptValue::Int(1));
                }
                Ok(ScriptValue::Int(0))
            }

            ScriptKind::ReleaseAndPublish => {
                let key = call.key(0)?;
                let channel = call.key(1)?;
                let token = call.arg(0)?;
                let message = call.arg(1)?;
                if read_str(data, key)?.as_deref() != Some(token) {
                    return Ok(ScriptValue::Int(0));
                }
                data.remove(key);
                let receivers = publish_to(channels, channel, message);
                trace!(channel = %channel, receivers, "published release");
                Ok(ScriptValue::Int(1))
            }

            ScriptKind::EnqueueWaiter => {
                let queue_key = call.key(0)?;
                let client_id = call.arg(0)?;
                let raw_entry = call.arg(1)?;
                let ttl = millis_arg(call, 2)?;
                let Some(entry) = list_mut(data, queue_key, true)? else {
                    return Err(wrong_type(queue_key, "list"));
                };
                let Value::List(items) = &mut entry.value else {
                    return Err(wrong_type(queue_key, "list"));
                };
                let already_queued = items.iter().any(|raw| {
                    serde_json::from_str::<QueueEntry>(raw).is_ok_and(|e| e.client_id == client_id)
                });
                if !already_queued {
                    items.push_back(raw_entry.to_string());
                }
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(ScriptValue::Int(if already_queued { 0 } else { 1 }))
            }

            ScriptKind::RemoveWaiter => {
                let queue_key = call.key(0)?;
                let client_id = call.arg(0)?;
                let removed = match list_mut(data, queue_key, false)? {
                    Some(Entry { value: Value::List(items), .. }) => {
                        let position = items.iter().position(|raw| {
                            serde_json::from_str::<QueueEntry>(raw).is_ok_and(|e| e.client_id == client_id)
                        });
                        position.and_then(|idx| items.remove(idx)).is_some()
                    }
                    _ => false,
                };
                if matches!(data.get(queue_key), Some(Entry { value: Value::List(items), .. }) if items.is_empty()) {
                    data.remove(queue_key);
                }
                Ok(ScriptValue::Int(if removed { 1 } else { 0 }))
            }

            ScriptKind::ReleaseAndNotifyNext => {
                let key = call.key(0)?;
                let queue_key = call.key(1)?;
                let channel = call.key(2)?;
                let token = call.arg(0)?;
                let lock_ttl_ms = call.int_arg(1)?;
                let now_ms = call.int_arg(2)?;
                if read_str(data, key)?.as_deref() != Some(token) {
                    return Ok(ScriptValue::Int(0));
                }
                data.remove(key);
                while let Some(raw) = pop_front(data, queue_key)? {
                    match serde_json::from_str::<QueueEntry>(&raw) {
                        Ok(entry) if now_ms - entry.enqueued_at <= lock_ttl_ms => {
                            publish_to(channels, channel, &entry.client_id);
                            return Ok(ScriptValue::Text(entry.client_id));
                        }
                        Ok(entry) => {
                            debug!(queue = %queue_key, client_id = %entry.client_id, "skipping stale waiter");
                        }
                        Err(e) => {
                            warn!(queue = %queue_key, error = %e, "dropping malformed queue entry");
                        }
                    }
                }
                Ok(ScriptValue::Int(1))
            }

            ScriptKind::IssueFencingToken => {
                let counter_key = call.key(0)?;
                let ttl = millis_arg(call, 0)?;
                incr_locked(data, counter_key, ttl).map(ScriptValue::Int)
            }

            ScriptKind::Extend => {
                let key = call.key(0)?;
                let token = call.arg(0)?;
                let ttl = millis_arg(call, 1)?;
                if read_str(data, key)?.as_deref() != Some(token) {
                    return Ok(ScriptValue::Int(0));
                }
                if let Some(entry) = data.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
                Ok(ScriptValue::Int(1))
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let data = self.data.read().await;
        read_str(&data, key)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), Entry::new(Value::Str(value.to_string())));
        Ok(())
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), Entry::new_with_ttl(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        if entry_mut(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(key.to_string(), Entry::new_with_ttl(Value::Str(value.to_string()), ttl));
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some_and(|e| !e.is_expired()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let data = self.data.read().await;
        Ok(live(&data, key).is_some())
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let data = self.data.read().await;
        Ok(live(&data, key).and_then(Entry::ttl_remaining))
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut data = self.data.write().await;
        incr_locked(&mut data, key, ttl)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut data = self.data.write().await;
        match list_mut(&mut data, key, true)? {
            Some(Entry { value: Value::List(items), .. }) => {
                items.push_back(value.to_string());
                Ok(items.len())
            }
            _ => Err(wrong_type(key, "list")),
        }
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.data.write().await;
        pop_front(&mut data, key)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let data = self.data.read().await;
        match live(&data, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(items), .. }) => Ok(resolve_range(items.len(), start, stop)
                .map(|(from, to)| items.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let data = self.data.read().await;
        match live(&data, key) {
            None => Ok(0),
            Some(Entry { value: Value::List(items), .. }) => Ok(items.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        let mut data = self.data.write().await;
        if entry_mut(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        match data.get_mut(key) {
            Some(Entry { value: Value::ZSet(members), .. }) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            _ => Err(wrong_type(key, "zset")),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let data = self.data.read().await;
        match live(&data, key) {
            None => Ok(None),
            Some(Entry { value: Value::ZSet(members), .. }) => Ok(members.get(member).copied()),
            Some(_) => Err(wrong_type(key, "zset")),
        }
    }

    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
        let data = self.data.read().await;
        let members = match live(&data, key) {
            None => return Ok(Vec::new()),
            Some(Entry { value: Value::ZSet(members), .. }) => members,
            Some(_) => return Err(wrong_type(key, "zset")),
        };
        let mut ranked: Vec<(String, f64)> = members.iter().map(|(m, s)| (m.clone(), *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(resolve_range(ranked.len(), start, stop)
            .map(|(from, to)| ranked[from..=to].to_vec())
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        match entry_mut(&mut data, key) {
            None => Ok(false),
            Some(Entry { value: Value::ZSet(members), .. }) => Ok(members.remove(member).is_some()),
            Some(_) => Err(wrong_type(key, "zset")),
        }
    }

    async fn eval(&self, call: &ScriptCall) -> StoreResult<ScriptValue> {
        let mut data = self.data.write().await;
        let channels = self.channels.read().await;
        Self::eval_locked(&mut data, &channels, call)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let channels = self.channels.read().await;
        Ok(publish_to(&channels, channel, message))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut rx = {
            let mut channels = self.channels.write().await;
            // drop channels whose subscribers are all gone
            channels.retain(|_, sender| sender.receiver_count() > 0);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let channel_name = channel.to_string();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(message) => yield message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
