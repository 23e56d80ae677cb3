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

//! Contract tests run against the store returned by the config factory.

use plexspaces_store::{create_store_from_config, AtomicScripts, LockStore, QueueEntry, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

async fn store() -> Arc<dyn LockStore> {
    create_store_from_config(StoreConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_only_one_concurrent_acquire_wins() {
    let store = store().await;
    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .try_acquire("contended", &format!("token-{}", i), Duration::from_secs(5))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_concurrent_fencing_tokens_are_unique() {
    let store = store().await;
    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .issue_fencing_token("res:fencing", Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap());
    }
    tokens.sort_unstable();
    assert_eq!(tokens, (1..=50).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_queue_preserves_enqueue_order() {
    let store = store().await;
    let ttl = Duration::from_secs(5);
    for (i, client) in ["a", "b", "c"].iter().enumerate() {
        let entry = QueueEntry {
            client_id: client.to_string(),
            enqueued_at: i as i64,
        };
        store.enqueue_waiter("res:queue", &entry, ttl).await.unwrap();
    }

    let raw = store.lrange("res:queue", 0, -1).await.unwrap();
    let order: Vec<String> = raw
        .iter()
        .map(|r| serde_json::from_str::<QueueEntry>(r).unwrap().client_id)
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}
