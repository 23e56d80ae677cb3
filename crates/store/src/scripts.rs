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

//! Atomic multi-step store scripts.
//!
//! ## Purpose
//! Every multi-step lock operation (verify-then-delete, delete-then-publish,
//! dequeue-and-notify, fencing issuance) must run as one atomic unit on the
//! store. Each script here is:
//! - a pure builder from `(keys, args)` to a [`ScriptCall`] carrying the Lua text
//! - a typed parser turning the raw [`ScriptValue`] reply into a Rust value
//!
//! Backends execute a [`ScriptCall`] through [`LockStore::eval`]. Redis runs the
//! Lua source; the in-memory backend runs an equivalent routine under its write
//! lock. [`AtomicScripts`] glues builder, executor and parser together.
//!
//! ## Key layout
//! | Script | KEYS | ARGV |
//! |---|---|---|
//! | `acquire` | lock | token, ttl_ms |
//! | `release` | lock | token |
//! | `release_and_publish` | lock, channel | token, message |
//! | `enqueue_waiter` | queue | client_id, entry_json, queue_ttl_ms |
//! | `remove_waiter` | queue | client_id |
//! | `release_and_notify_next` | lock, queue, channel | token, lock_ttl_ms, now_ms |
//! | `issue_fencing_token` | counter | ttl_ms |
//! | `extend` | lock | token, ttl_ms |

use crate::{LockStore, StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ACQUIRE_LUA: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 1
end
return 0
"#;

const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RELEASE_AND_PUBLISH_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  redis.call('PUBLISH', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

const ENQUEUE_WAITER_LUA: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  local ok, entry = pcall(cjson.decode, raw)
  if ok and entry.clientId == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    return 0
  end
end
redis.call('RPUSH', KEYS[1], ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

const REMOVE_WAITER_LUA: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  local ok, entry = pcall(cjson.decode, raw)
  if ok and entry.clientId == ARGV[1] then
    return redis.call('LREM', KEYS[1], 1, raw)
  end
end
return 0
"#;

const RELEASE_AND_NOTIFY_NEXT_LUA: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
local ttl = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
while true do
  local raw = redis.call('LPOP', KEYS[2])
  if not raw then
    return 1
  end
  local ok, entry = pcall(cjson.decode, raw)
  if ok and (now - tonumber(entry.enqueuedAt)) <= ttl then
    redis.call('PUBLISH', KEYS[3], entry.clientId)
    return entry.clientId
  end
end
"#;

const ISSUE_FENCING_TOKEN_LUA: &str = r#"
local token = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return token
"#;

const EXTEND_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Identifies an atomic script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    /// SET key=token NX PX ttl
    Acquire,
    /// Compare value with token, delete on match
    Release,
    /// Compare, delete and publish a release message
    ReleaseAndPublish,
    /// Append a waiter unless its client id is already queued
    EnqueueWaiter,
    /// Remove a waiter by client id
    RemoveWaiter,
    /// Compare, delete, pop stale waiters and notify the first live one
    ReleaseAndNotifyNext,
    /// INCR a counter and refresh its TTL
    IssueFencingToken,
    /// Compare value with token, refresh TTL on match
    Extend,
}

impl ScriptKind {
    /// Every script, in declaration order.
    pub const ALL: [ScriptKind; 8] = [
        ScriptKind::Acquire,
        ScriptKind::Release,
        ScriptKind::ReleaseAndPublish,
        ScriptKind::EnqueueWaiter,
        ScriptKind::RemoveWaiter,
        ScriptKind::ReleaseAndNotifyNext,
        ScriptKind::IssueFencingToken,
        ScriptKind::Extend,
    ];

    /// Script name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            ScriptKind::Acquire => "acquire",
            ScriptKind::Release => "release",
            ScriptKind::ReleaseAndPublish => "release_and_publish",
            ScriptKind::EnqueueWaiter => "enqueue_waiter",
            ScriptKind::RemoveWaiter => "remove_waiter",
            ScriptKind::ReleaseAndNotifyNext => "release_and_notify_next",
            ScriptKind::IssueFencingToken => "issue_fencing_token",
            ScriptKind::Extend => "extend",
        }
    }

    /// Lua source executed by script-capable backends.
    pub fn source(self) -> &'static str {
        match self {
            ScriptKind::Acquire => ACQUIRE_LUA,
            ScriptKind::Release => RELEASE_LUA,
            ScriptKind::ReleaseAndPublish => RELEASE_AND_PUBLISH_LUA,
            ScriptKind::EnqueueWaiter => ENQUEUE_WAITER_LUA,
            ScriptKind::RemoveWaiter => REMOVE_WAITER_LUA,
            ScriptKind::ReleaseAndNotifyNext => RELEASE_AND_NOTIFY_NEXT_LUA,
            ScriptKind::IssueFencingToken => ISSUE_FENCING_TOKEN_LUA,
            ScriptKind::Extend => EXTEND_LUA,
        }
    }
}

/// A fully bound script invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    /// Which script to run
    pub kind: ScriptKind,
    /// KEYS[] in script order
    pub keys: Vec<String>,
    /// ARGV[] in script order
    pub args: Vec<String>,
}

impl ScriptCall {
    fn new(kind: ScriptKind, keys: Vec<String>, args: Vec<String>) -> Self {
        Self { kind, keys, args }
    }

    /// KEYS[index] or an `InvalidArgument` error.
    pub fn key(&self, index: usize) -> StoreResult<&str> {
        self.keys
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| StoreError::InvalidArgument {
                script: self.kind.name(),
                reason: format!("missing KEYS[{}]", index + 1),
            })
    }

    /// ARGV[index] or an `InvalidArgument` error.
    pub fn arg(&self, index: usize) -> StoreResult<&str> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| StoreError::InvalidArgument {
                script: self.kind.name(),
                reason: format!("missing ARGV[{}]", index + 1),
            })
    }

    /// ARGV[index] parsed as a signed integer.
    pub fn int_arg(&self, index: usize) -> StoreResult<i64> {
        let raw = self.arg(index)?;
        raw.parse::<i64>().map_err(|_| StoreError::InvalidArgument {
            script: self.kind.name(),
            reason: format!("ARGV[{}] is not an integer: {}", index + 1, raw),
        })
    }
}

/// Raw script reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// nil / false
    Nil,
    /// Integer reply
    Int(i64),
    /// Bulk or status string reply
    Text(String),
}

/// One waiting client in a lock's FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Waiter identity; notifications carry this value
    pub client_id: String,
    /// Enqueue time in milliseconds since the Unix epoch
    pub enqueued_at: i64,
}

/// Outcome of [`ScriptKind::ReleaseAndNotifyNext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock was not held with the given token (expired or stolen)
    NotHeld,
    /// Lock deleted; `notified` names the waiter that was woken, if any
    Released {
        /// Client id published on the lock channel
        notified: Option<String>,
    },
}

fn ttl_millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

/// SET `key`=`token` if absent with a TTL.
pub fn acquire(key: &str, token: &str, ttl: Duration) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::Acquire,
        vec![key.to_string()],
        vec![token.to_string(), ttl_millis(ttl)],
    )
}

/// Delete `key` only if it still holds `token`.
pub fn release(key: &str, token: &str) -> ScriptCall {
    ScriptCall::new(ScriptKind::Release, vec![key.to_string()], vec![token.to_string()])
}

/// Delete `key` if it holds `token` and publish `message` on `channel`.
pub fn release_and_publish(key: &str, token: &str, channel: &str, message: &str) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::ReleaseAndPublish,
        vec![key.to_string(), channel.to_string()],
        vec![token.to_string(), message.to_string()],
    )
}

/// Append `entry` to `queue_key` unless its client is already waiting.
pub fn enqueue_waiter(queue_key: &str, entry: &QueueEntry, queue_ttl: Duration) -> StoreResult<ScriptCall> {
    Ok(ScriptCall::new(
        ScriptKind::EnqueueWaiter,
        vec![queue_key.to_string()],
        vec![entry.client_id.clone(), serde_json::to_string(entry)?, ttl_millis(queue_ttl)],
    ))
}

/// Remove the first entry for `client_id` from `queue_key`.
pub fn remove_waiter(queue_key: &str, client_id: &str) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::RemoveWaiter,
        vec![queue_key.to_string()],
        vec![client_id.to_string()],
    )
}

/// Release `key` and hand off to the oldest non-stale waiter.
pub fn release_and_notify_next(
    key: &str,
    token: &str,
    queue_key: &str,
    channel: &str,
    lock_ttl: Duration,
    now_ms: i64,
) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::ReleaseAndNotifyNext,
        vec![key.to_string(), queue_key.to_string(), channel.to_string()],
        vec![token.to_string(), ttl_millis(lock_ttl), now_ms.to_string()],
    )
}

/// INCR `counter_key` and refresh its TTL.
pub fn issue_fencing_token(counter_key: &str, ttl: Duration) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::IssueFencingToken,
        vec![counter_key.to_string()],
        vec![ttl_millis(ttl)],
    )
}

/// Refresh the TTL of `key` only if it still holds `token`.
pub fn extend(key: &str, token: &str, ttl: Duration) -> ScriptCall {
    ScriptCall::new(
        ScriptKind::Extend,
        vec![key.to_string()],
        vec![token.to_string(), ttl_millis(ttl)],
    )
}

fn unexpected(kind: ScriptKind, value: &ScriptValue) -> StoreError {
    StoreError::UnexpectedReply {
        script: kind.name(),
        reply: format!("{:?}", value),
    }
}

/// Parse a 0/1 style reply.
pub fn parse_flag(kind: ScriptKind, value: ScriptValue) -> StoreResult<bool> {
    match value {
        ScriptValue::Int(n) => Ok(n > 0),
        ScriptValue::Nil => Ok(false),
        ScriptValue::Text(ref s) if s == "OK" => Ok(true),
        other => Err(unexpected(kind, &other)),
    }
}

/// Parse an integer counter reply.
pub fn parse_counter(kind: ScriptKind, value: ScriptValue) -> StoreResult<i64> {
    match value {
        ScriptValue::Int(n) => Ok(n),
        ScriptValue::Text(ref s) => s.parse::<i64>().map_err(|_| unexpected(kind, &value)),
        other => Err(unexpected(kind, &other)),
    }
}

/// Parse the dequeue-and-notify reply: `0` not held, `1` released with an
/// empty queue, a string names the notified client.
pub fn parse_release_outcome(kind: ScriptKind, value: ScriptValue) -> StoreResult<ReleaseOutcome> {
    match value {
        ScriptValue::Int(0) | ScriptValue::Nil => Ok(ReleaseOutcome::NotHeld),
        ScriptValue::Int(1) => Ok(ReleaseOutcome::Released { notified: None }),
        ScriptValue::Text(client_id) => Ok(ReleaseOutcome::Released {
            notified: Some(client_id),
        }),
        other => Err(unexpected(kind, &other)),
    }
}

/// Typed execution of the lock scripts on any [`LockStore`].
#[async_trait]
pub trait AtomicScripts: LockStore {
    /// Run [`acquire`]; `true` when the lock record was written.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let call = acquire(key, token, ttl);
        parse_flag(call.kind, self.eval(&call).await?)
    }

    /// Run [`release`]; `true` when this token's record was deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        let call = release(key, token);
        parse_flag(call.kind, self.eval(&call).await?)
    }

    /// Run [`release_and_publish`].
    async fn release_and_publish(&self, key: &str, token: &str, channel: &str, message: &str) -> StoreResult<bool> {
        let call = release_and_publish(key, token, channel, message);
        parse_flag(call.kind, self.eval(&call).await?)
    }

    /// Run [`enqueue_waiter`]; `true` when a new entry was appended.
    async fn enqueue_waiter(&self, queue_key: &str, entry: &QueueEntry, queue_ttl: Duration) -> StoreResult<bool> {
        let call = enqueue_waiter(queue_key, entry, queue_ttl)?;
        parse_flag(call.kind, self.eval(&call).await?)
    }

    /// Run [`remove_waiter`]; `true` when an entry was removed.
    async fn remove_waiter(&self, queue_key: &str, client_id: &str) -> StoreResult<bool> {
        let call = remove_waiter(queue_key, client_id);
        parse_flag(call.kind, self.eval(&call).await?)
    }

    /// Run [`release_and_notify_next`].
    async fn release_and_notify_next(
        &self,
        key: &str,
        token: &str,
        queue_key: &str,
        channel: &str,
        lock_ttl: Duration,
        now_ms: i64,
    ) -> StoreResult<ReleaseOutcome> {
        let call = release_and_notify_next(key, token, queue_key, channel, lock_ttl, now_ms);
        parse_release_outcome(call.kind, self.eval(&call).await?)
    }

    /// Run [`issue_fencing_token`] and return the new counter value.
    async fn issue_fencing_token(&self, counter_key: &str, ttl: Duration) -> StoreResult<i64> {
        let call = issue_fencing_token(counter_key, ttl);
        parse_counter(call.kind, self.eval(&call).await?)
    }

    /// Run [`extend`]; `true` when the TTL was refreshed.
    async fn extend_lease(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let call = extend(key, token, ttl);
        parse_flag(call.kind, self.eval(&call).await?)
    }
}

impl<S: LockStore + ?Sized> AtomicScripts for S {}
