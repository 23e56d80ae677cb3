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

//! Auxiliary store keys derived from a lock key.

use crate::{LockError, LockResult};

/// Message published on a lock's channel when a pub/sub lock is released.
pub const RELEASED_MESSAGE: &str = "released";

/// Store keys used for one lock key `K`.
///
/// | Key | Purpose |
/// |---|---|
/// | `K` | lock record (holder token, TTL = lease) |
/// | `K:channel` | release / wake-up notifications |
/// | `K:queue` | FIFO waiters (queue lock) |
/// | `K:fencing` | monotonic counter (fencing lock) |
/// | `K:fencing_value` | currently valid fencing token |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// Lock record key
    pub lock: String,
    /// Pub/sub channel
    pub channel: String,
    /// Waiter list
    pub queue: String,
    /// Fencing counter
    pub fencing: String,
    /// Current fencing token
    pub fencing_value: String,
}

impl LockKeys {
    /// Derive the key set for `key`.
    ///
    /// ## Errors
    /// [`LockError::InvalidKey`] for an empty or whitespace-only key.
    pub fn new(key: &str) -> LockResult<Self> {
        if key.trim().is_empty() {
            return Err(LockError::InvalidKey("lock key must not be empty".to_string()));
        }
        Ok(Self {
            lock: key.to_string(),
            channel: format!("{}:channel", key),
            queue: format!("{}:queue", key),
            fencing: format!("{}:fencing", key),
            fencing_value: format!("{}:fencing_value", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = LockKeys::new("coupon:42").unwrap();
        assert_eq!(keys.lock, "coupon:42");
        assert_eq!(keys.channel, "coupon:42:channel");
        assert_eq!(keys.queue, "coupon:42:queue");
        assert_eq!(keys.fencing, "coupon:42:fencing");
        assert_eq!(keys.fencing_value, "coupon:42:fencing_value");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(LockKeys::new("  "), Err(LockError::InvalidKey(_))));
    }
}
