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

//! Redis-backed lock store.
//!
//! ## Purpose
//! Runs the lock primitives against a shared Redis server so that several
//! processes can coordinate.
//!
//! ## Features
//! - **Native TTL**: `SET .. NX PX` and `PEXPIRE`
//! - **Lua scripts**: every [`ScriptCall`] runs as one `EVALSHA`, loaded on demand
//! - **Pub/Sub**: release notifications via `SUBSCRIBE`
//! - **Namespace prefix**: keys and channels are isolated per application
//!
//! ## Usage
//! ```rust,no_run
//! use plexspaces_store::{AtomicScripts, RedisStore};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::new("redis://localhost:6379", "orders").await?;
//! if store.try_acquire("lock:order:42", "token-1", Duration::from_secs(5)).await? {
//!     store.compare_and_delete("lock:order:42", "token-1").await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::scripts::{ScriptCall, ScriptKind, ScriptValue};
use crate::{LockStore, StoreError, StoreResult, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, Client, Script, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Redis-based [`LockStore`].
///
/// ## Design Decisions
/// - **ConnectionManager** for commands: pooled, reconnects automatically
/// - **Dedicated connection per subscription**: pub/sub connections cannot
///   issue regular commands
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    namespace: String,
    scripts: HashMap<ScriptKind, Script>,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// ## Arguments
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `namespace` - Key prefix for isolation (e.g., "orders")
    ///
    /// ## Errors
    /// - [`StoreError::ConnectionFailed`]: If Redis connection fails
    pub async fn new(url: &str, namespace: &str) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::ConnectionFailed(format!("Invalid Redis URL {}: {}", url, e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(format!("Redis connect failed: {}", e)))?;
        let scripts = ScriptKind::ALL
            .iter()
            .map(|kind| (*kind, Script::new(kind.source())))
            .collect();

        debug!(url = %url, namespace = %namespace, "connected to redis store");
        Ok(Self {
            client,
            manager,
            namespace: format!("{}:", namespace),
            scripts,
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn to_script_value(kind: ScriptKind, value: Value) -> StoreResult<ScriptValue> {
        match value {
            Value::Nil => Ok(ScriptValue::Nil),
            Value::Int(n) => Ok(ScriptValue::Int(n)),
            Value::Okay => Ok(ScriptValue::Text("OK".to_string())),
            Value::SimpleString(s) => Ok(ScriptValue::Text(s)),
            Value::BulkString(bytes) => String::from_utf8(bytes)
                .map(ScriptValue::Text)
                .map_err(|e| StoreError::UnexpectedReply {
                    script: kind.name(),
                    reply: format!("non-utf8 bulk string: {}", e),
                }),
            other => Err(StoreError::UnexpectedReply {
                script: kind.name(),
                reply: format!("{:?}", other),
            }),
        }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LockStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value = redis::cmd("GET")
            .arg(self.prefixed(key))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply = redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed = redis::cmd("DEL")
            .arg(self.prefixed(key))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let count = redis::cmd("EXISTS")
            .arg(self.prefixed(key))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.manager.clone();
        let ms = redis::cmd("PTTL")
            .arg(self.prefixed(key))
            .query_async::<i64>(&mut conn)
            .await?;
        // -2: no key, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        let prefixed = self.prefixed(key);
        let (value,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&prefixed)
            .cmd("PEXPIRE")
            .arg(&prefixed)
            .arg(ttl_ms(ttl))
            .ignore()
            .query_async::<(i64,)>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.manager.clone();
        let len = redis::cmd("RPUSH")
            .arg(self.prefixed(key))
            .arg(value)
            .query_async::<usize>(&mut conn)
            .await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value = redis::cmd("LPOP")
            .arg(self.prefixed(key))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let values = redis::cmd("LRANGE")
            .arg(self.prefixed(key))
            .arg(start)
            .arg(stop)
            .query_async::<Vec<String>>(&mut conn)
            .await?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.manager.clone();
        let len = redis::cmd("LLEN")
            .arg(self.prefixed(key))
            .query_async::<usize>(&mut conn)
            .await?;
        Ok(len)
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.manager.clone();
        let score = redis::cmd("ZINCRBY")
            .arg(self.prefixed(key))
            .arg(delta)
            .arg(member)
            .query_async::<f64>(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.manager.clone();
        let score = redis::cmd("ZSCORE")
            .arg(self.prefixed(key))
            .arg(member)
            .query_async::<Option<f64>>(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zrevrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        let ranked = redis::cmd("ZREVRANGE")
            .arg(self.prefixed(key))
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async::<Vec<(String, f64)>>(&mut conn)
            .await?;
        Ok(ranked)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed = redis::cmd("ZREM")
            .arg(self.prefixed(key))
            .arg(member)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn eval(&self, call: &ScriptCall) -> StoreResult<ScriptValue> {
        let script = self.scripts.get(&call.kind).ok_or_else(|| StoreError::InvalidArgument {
            script: call.kind.name(),
            reason: "script not registered".to_string(),
        })?;
        let mut invocation = script.prepare_invoke();
        for key in &call.keys {
            invocation.key(self.prefixed(key));
        }
        for arg in &call.args {
            invocation.arg(arg);
        }

        let mut conn = self.manager.clone();
        let reply = invocation
            .invoke_async::<Value>(&mut conn)
            .await
            .map_err(|e| StoreError::BackendError(format!("Script {} failed: {}", call.kind.name(), e)))?;
        Self::to_script_value(call.kind, reply)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut conn = self.manager.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(self.prefixed(channel))
            .arg(message)
            .query_async::<usize>(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let prefixed = self.prefixed(channel);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::SubscriptionError(format!("pub/sub connect failed: {}", e)))?;
        pubsub
            .subscribe(&prefixed)
            .await
            .map_err(|e| StoreError::SubscriptionError(format!("SUBSCRIBE {} failed: {}", prefixed, e)))?;

        let stream = async_stream::stream! {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => yield payload,
                    Err(e) => warn!(channel = %prefixed, error = %e, "dropping undecodable message"),
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "Redis"
    }
}
