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

//! Saga configuration.

use crate::{SagaError, SagaResult};
use plexspaces_locks::{LockOptions, LockStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store key of the recovery sweep lease.
pub const DEFAULT_SWEEP_LEASE_KEY: &str = "saga:recovery-sweep";

/// Tuning for services, the orchestrator and the recovery sweep.
///
/// ## Environment
/// | Variable | Default |
/// |---|---|
/// | `PLEXSPACES_LOCK_*` | see [`LockOptions::from_env`] |
/// | `PLEXSPACES_SAGA_COUPON_LOCK` | `queue` |
/// | `PLEXSPACES_SAGA_SERVICE_MAX_ATTEMPTS` / `_SERVICE_RETRY_DELAY_MS` | 5 / 20 |
/// | `PLEXSPACES_SAGA_PROCESS_MAX_ATTEMPTS` / `_PROCESS_RETRY_DELAY_MS` | 3 / 50 |
/// | `PLEXSPACES_SAGA_RECOVER_MAX_ATTEMPTS` / `_RECOVER_RETRY_DELAY_MS` | 5 / 100 |
/// | `PLEXSPACES_SAGA_STALE_PENDING_SECS` | 300 |
/// | `PLEXSPACES_SAGA_SWEEP_INTERVAL_SECS` | 60 |
/// | `PLEXSPACES_SAGA_SWEEP_LEASE_TTL_SECS` | 300 |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Options for every lock taken by services
    pub lock: LockOptions,
    /// Strategy guarding coupon quota
    pub coupon_lock: LockStrategy,
    /// Optimistic retry inside single-aggregate service calls
    pub service_retry: RetryPolicy,
    /// Retry around the whole process stage
    pub process_retry: RetryPolicy,
    /// Retry around compensation
    pub recover_retry: RetryPolicy,
    /// A `PENDING` order older than this is swept
    pub stale_pending_after: Duration,
    /// Delay between sweeps in [`crate::RecoverySweep::run`]
    pub sweep_interval: Duration,
    /// TTL of the deployment-wide sweep lease
    pub sweep_lease_ttl: Duration,
    /// Store key of the sweep lease
    pub sweep_lease_key: String,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            coupon_lock: LockStrategy::Queue,
            service_retry: RetryPolicy::new(5, Duration::from_millis(20)),
            process_retry: RetryPolicy::new(3, Duration::from_millis(50)),
            recover_retry: RetryPolicy::new(5, Duration::from_millis(100)),
            stale_pending_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            sweep_lease_ttl: Duration::from_secs(300),
            sweep_lease_key: DEFAULT_SWEEP_LEASE_KEY.to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_policy(prefix: &str, fallback: &RetryPolicy) -> RetryPolicy {
    RetryPolicy::new(
        env_parse(&format!("PLEXSPACES_SAGA_{}_MAX_ATTEMPTS", prefix)).unwrap_or(fallback.max_attempts),
        env_parse(&format!("PLEXSPACES_SAGA_{}_RETRY_DELAY_MS", prefix))
            .map(Duration::from_millis)
            .unwrap_or(fallback.delay),
    )
}

impl SagaConfig {
    /// Load from environment variables, falling back to defaults for unset
    /// or unparsable values.
    pub fn from_env() -> SagaResult<Self> {
        let defaults = Self::default();
        let config = Self {
            lock: LockOptions::from_env()?,
            coupon_lock: match std::env::var("PLEXSPACES_SAGA_COUPON_LOCK") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.coupon_lock,
            },
            service_retry: env_policy("SERVICE", &defaults.service_retry),
            process_retry: env_policy("PROCESS", &defaults.process_retry),
            recover_retry: env_policy("RECOVER", &defaults.recover_retry),
            stale_pending_after: env_parse("PLEXSPACES_SAGA_STALE_PENDING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_pending_after),
            sweep_interval: env_parse("PLEXSPACES_SAGA_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            sweep_lease_ttl: env_parse("PLEXSPACES_SAGA_SWEEP_LEASE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_lease_ttl),
            sweep_lease_key: defaults.sweep_lease_key,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the saga cannot run with.
    pub fn validate(&self) -> SagaResult<()> {
        self.lock.validate()?;
        for (name, policy) in [
            ("service_retry", &self.service_retry),
            ("process_retry", &self.process_retry),
            ("recover_retry", &self.recover_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(SagaError::ConfigError(format!("{}.max_attempts must be at least 1", name)));
            }
        }
        if self.sweep_interval.is_zero() || self.sweep_lease_ttl.is_zero() {
            return Err(SagaError::ConfigError(
                "sweep_interval and sweep_lease_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock options for the sweep lease: one attempt, lease TTL as `ttl`.
    pub fn sweep_lock_options(&self) -> LockOptions {
        self.lock.clone().with_ttl(self.sweep_lease_ttl).with_max_attempts(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "PLEXSPACES_SAGA_COUPON_LOCK",
        "PLEXSPACES_SAGA_PROCESS_MAX_ATTEMPTS",
        "PLEXSPACES_SAGA_PROCESS_RETRY_DELAY_MS",
        "PLEXSPACES_SAGA_STALE_PENDING_SECS",
        "PLEXSPACES_SAGA_SWEEP_INTERVAL_SECS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SagaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.process_retry.max_attempts, 3);

        let sweep = config.sweep_lock_options();
        assert_eq!(sweep.max_attempts, 1);
        assert_eq!(sweep.ttl, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear();
        std::env::set_var("PLEXSPACES_SAGA_PROCESS_MAX_ATTEMPTS", "7");
        std::env::set_var("PLEXSPACES_SAGA_PROCESS_RETRY_DELAY_MS", "5");
        std::env::set_var("PLEXSPACES_SAGA_STALE_PENDING_SECS", "30");
        std::env::set_var("PLEXSPACES_SAGA_SWEEP_INTERVAL_SECS", "not-a-number");
        std::env::set_var("PLEXSPACES_SAGA_COUPON_LOCK", "redlock");

        let config = SagaConfig::from_env().unwrap();
        assert_eq!(config.process_retry, RetryPolicy::new(7, Duration::from_millis(5)));
        assert_eq!(config.stale_pending_after, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.coupon_lock, LockStrategy::Quorum);
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_attempts() {
        clear();
        std::env::set_var("PLEXSPACES_SAGA_PROCESS_MAX_ATTEMPTS", "0");
        assert!(matches!(SagaConfig::from_env(), Err(SagaError::ConfigError(_))));
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_strategy() {
        clear();
        std::env::set_var("PLEXSPACES_SAGA_COUPON_LOCK", "mutex");
        assert!(matches!(
            SagaConfig::from_env(),
            Err(SagaError::Lock(plexspaces_locks::LockError::ConfigError(_)))
        ));
        clear();
    }
}
