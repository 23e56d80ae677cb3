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

//! Recovery sweep for orders stuck in `FAILED` or long-`PENDING`.
//!
//! ## Design
//! - Single flight per process through an `AtomicBool`
//! - Single flight per deployment through a store lease
//!   (`saga:recovery-sweep`) taken with a one-attempt [`SpinLock`]; a sweep
//!   that finds the lease held reports itself as skipped
//! - Per-order failures are counted and logged, never raised
//! - [`RecoverySweep::run`] ticks on `sweep_interval` until
//!   [`RecoverySweep::shutdown`]

use crate::{OrderSaga, SagaConfig, SagaError, SagaResult};
use chrono::Utc;
use plexspaces_locks::{DistributedLock, LockError, SpinLock, WithLock};
use plexspaces_store::LockStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Orders examined
    pub scanned: usize,
    /// Orders compensated and marked `FAILED` by this sweep
    pub recovered: usize,
    /// Orders found already compensated
    pub unchanged: usize,
    /// Orders whose recovery raised
    pub failed: usize,
    /// Ids of the failed orders
    pub failed_order_ids: Vec<String>,
    /// `true` when another sweep was already running
    pub skipped: bool,
}

impl RecoveryReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Periodic re-driver of [`OrderSaga::recover`].
pub struct RecoverySweep {
    saga: Arc<OrderSaga>,
    lease: Arc<dyn DistributedLock>,
    config: SagaConfig,
    running: AtomicBool,
    shutdown: Notify,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecoverySweep {
    /// Sweep using the saga's configuration, with its lease in `store`.
    pub fn new(saga: Arc<OrderSaga>, store: Arc<dyn LockStore>) -> Self {
        let config = saga.config().clone();
        Self {
            saga,
            lease: Arc::new(SpinLock::new(store)),
            config,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// `true` while a sweep runs in this process.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep now.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> SagaResult<RecoveryReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("recovery sweep already running in this process");
            metrics::counter!("plexspaces_recovery_sweeps_total", "outcome" => "skipped").increment(1);
            return Ok(RecoveryReport::skipped());
        }
        let _guard = RunningGuard(&self.running);

        let options = self.config.sweep_lock_options();
        let result = self
            .lease
            .with_lock(&self.config.sweep_lease_key, &options, |_lease| self.sweep())
            .await;

        match result {
            Err(SagaError::Lock(LockError::Timeout { .. })) => {
                debug!(lease = %self.config.sweep_lease_key, "recovery sweep lease held elsewhere");
                metrics::counter!("plexspaces_recovery_sweeps_total", "outcome" => "skipped").increment(1);
                Ok(RecoveryReport::skipped())
            }
            other => other,
        }
    }

    async fn sweep(&self) -> SagaResult<RecoveryReport> {
        let stale = chrono::Duration::from_std(self.config.stale_pending_after)
            .map_err(|e| SagaError::ConfigError(format!("stale_pending_after out of range: {}", e)))?;
        let candidates = self.saga.orders().find_recoverable(Utc::now() - stale).await?;

        let mut report = RecoveryReport {
            scanned: candidates.len(),
            ..RecoveryReport::default()
        };
        for order in candidates {
            match self.saga.recover(&order.id).await {
                Ok(recovery) if recovery.changed > 0 => report.recovered += 1,
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    error!(order_id = %order.id, status = %order.status, error = %e, "order recovery failed");
                    report.failed += 1;
                    report.failed_order_ids.push(order.id);
                }
            }
        }

        metrics::counter!("plexspaces_recovery_sweeps_total", "outcome" => "completed").increment(1);
        metrics::counter!("plexspaces_recovery_orders_total", "result" => "recovered").increment(report.recovered as u64);
        metrics::counter!("plexspaces_recovery_orders_total", "result" => "failed").increment(report.failed as u64);
        info!(
            scanned = report.scanned,
            recovered = report.recovered,
            unchanged = report.unchanged,
            failed = report.failed,
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `sweep_interval` until [`shutdown`](Self::shutdown).
    /// The first sweep runs immediately.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.sweep_interval.as_millis() as u64, "recovery sweep started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("recovery sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "recovery sweep failed");
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// Stop a running [`run`](Self::run) loop after its current sweep.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
