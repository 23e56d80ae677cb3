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

//! Lock acquisition options and backoff schedule.
//!
//! ## Environment Variables
//! - `PLEXSPACES_LOCK_TTL_MS`: lease duration (default: 5000)
//! - `PLEXSPACES_LOCK_TIMEOUT_MS`: total wait bound (default: 10000)
//! - `PLEXSPACES_LOCK_MAX_ATTEMPTS`: attempt bound for polling strategies (default: 100)
//! - `PLEXSPACES_LOCK_INITIAL_DELAY_MS`: first backoff delay (default: 10)
//! - `PLEXSPACES_LOCK_MAX_DELAY_MS`: backoff cap (default: 1000)

use crate::{LockError, LockResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff growth between spin attempts, as the ratio 3/2.
const BACKOFF_NUMERATOR: u32 = 3;
const BACKOFF_DENOMINATOR: u32 = 2;

/// Options shared by every lock strategy.
///
/// ## Examples
/// ```rust
/// use plexspaces_locks::LockOptions;
/// use std::time::Duration;
///
/// let options = LockOptions::default()
///     .with_ttl(Duration::from_secs(2))
///     .with_timeout(Duration::from_millis(500));
/// assert_eq!(options.max_attempts, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lease duration written with the lock record
    pub ttl: Duration,
    /// Upper bound on total time spent waiting
    pub timeout: Duration,
    /// Upper bound on acquisition attempts (polling strategies)
    pub max_attempts: u32,
    /// First backoff delay
    pub initial_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5_000),
            timeout: Duration::from_millis(10_000),
            max_attempts: 100,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1_000),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl LockOptions {
    /// Create options from environment variables, falling back to defaults
    /// for unset or unparsable values.
    pub fn from_env() -> LockResult<Self> {
        let defaults = Self::default();
        let options = Self {
            ttl: env_millis("PLEXSPACES_LOCK_TTL_MS").unwrap_or(defaults.ttl),
            timeout: env_millis("PLEXSPACES_LOCK_TIMEOUT_MS").unwrap_or(defaults.timeout),
            max_attempts: std::env::var("PLEXSPACES_LOCK_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            initial_delay: env_millis("PLEXSPACES_LOCK_INITIAL_DELAY_MS").unwrap_or(defaults.initial_delay),
            max_delay: env_millis("PLEXSPACES_LOCK_MAX_DELAY_MS").unwrap_or(defaults.max_delay),
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject options no strategy can honour.
    pub fn validate(&self) -> LockResult<()> {
        if self.ttl.is_zero() {
            return Err(LockError::ConfigError("ttl must be greater than zero".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(LockError::ConfigError("max_attempts must be at least 1".to_string()));
        }
        if self.initial_delay > self.max_delay {
            return Err(LockError::ConfigError(format!(
                "initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Override the lease duration.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the total wait bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the first backoff delay.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Override the backoff cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// Exponential backoff: starts at `initial_delay`, grows by 1.5x per step, capped at `max_delay`, plus up to 10%
/// random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    /// Backoff schedule for the given options.
    pub fn new(options: &LockOptions) -> Self {
        Self {
            next: options.initial_delay.min(options.max_delay),
            max: options.max_delay,
        }
    }

    /// Base delay of the next step, without jitter.
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * BACKOFF_NUMERATOR / BACKOFF_DENOMINATOR).min(self.max);
        base + jitter(base)
    }
}

fn jitter(base: Duration) -> Duration {
    let max_ms = base.as_millis() as u64 / 10;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_millis(5_000));
        assert_eq!(options.timeout, Duration::from_millis(10_000));
        assert_eq!(options.max_attempts, 100);
        assert_eq!(options.initial_delay, Duration::from_millis(10));
        assert_eq!(options.max_delay, Duration::from_millis(1_000));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let options = LockOptions::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300));
        let mut backoff = Backoff::new(&options);

        let bases: Vec<u128> = (0..5)
            .map(|_| {
                let base = backoff.peek();
                let delay = backoff.next_delay();
                assert!(delay >= base);
                assert!(delay <= base + base / 10);
                base.as_millis()
            })
            .collect();
        assert_eq!(bases, vec![100, 150, 225, 300, 300]);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let options = LockOptions::default().with_max_attempts(0);
        assert!(matches!(options.validate(), Err(LockError::ConfigError(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("PLEXSPACES_LOCK_TTL_MS", "2500");
        std::env::set_var("PLEXSPACES_LOCK_MAX_ATTEMPTS", "7");
        std::env::set_var("PLEXSPACES_LOCK_TIMEOUT_MS", "not-a-number");

        let options = LockOptions::from_env().unwrap();
        assert_eq!(options.ttl, Duration::from_millis(2_500));
        assert_eq!(options.max_attempts, 7);
        assert_eq!(options.timeout, Duration::from_millis(10_000));

        std::env::remove_var("PLEXSPACES_LOCK_TTL_MS");
        std::env::remove_var("PLEXSPACES_LOCK_MAX_ATTEMPTS");
        std::env::remove_var("PLEXSPACES_LOCK_TIMEOUT_MS");
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_combination() {
        std::env::set_var("PLEXSPACES_LOCK_INITIAL_DELAY_MS", "5000");
        std::env::set_var("PLEXSPACES_LOCK_MAX_DELAY_MS", "100");

        assert!(LockOptions::from_env().is_err());

        std::env::remove_var("PLEXSPACES_LOCK_INITIAL_DELAY_MS");
        std::env::remove_var("PLEXSPACES_LOCK_MAX_DELAY_MS");
    }
}
