//! Payout scheduler
//!
//! One cycle = maturity check, then payouts. Cycles never overlap: a timer
//! tick or manual trigger that arrives mid-cycle is refused. When a cycle
//! confirms a block, payouts wait for the next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::{PayoutManager, PayoutReport};
use super::maturity::{MaturityReport, MaturityTracker};
use crate::error::CycleError;
use crate::storage::Store;

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub maintenance_interval: Duration,
    /// Shares older than this are purged by maintenance, the only place
    /// shares are ever deleted.
    pub share_retention: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(3600),
            share_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub maturity: Option<MaturityReport>,
    pub payout: Option<PayoutReport>,
    /// Payouts deferred because this cycle confirmed a block
    pub payout_deferred: bool,
}

pub struct PayoutScheduler {
    maturity: MaturityTracker,
    payouts: PayoutManager,
    store: Arc<dyn Store>,
    cfg: ScheduleConfig,
    running: AtomicBool,
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PayoutScheduler {
    pub fn new(
        maturity: MaturityTracker,
        payouts: PayoutManager,
        store: Arc<dyn Store>,
        cfg: ScheduleConfig,
    ) -> Self {
        Self { maturity, payouts, store, cfg, running: AtomicBool::new(false) }
    }

    pub fn payouts(&self) -> &PayoutManager {
        &self.payouts
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Manual trigger; same rules as a timer tick.
    pub async fn trigger(&self) -> Result<CycleReport, CycleError> {
        tracing::info!("Manual payout cycle requested");
        self.run_cycle().await
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CycleError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let mut report = CycleReport::default();
        match self.maturity.run().await {
            Ok(m) => {
                report.payout_deferred = m.confirmed > 0;
                report.maturity = Some(m);
            }
            Err(e) => tracing::warn!(error = %e, "Maturity check skipped"),
        }

        if report.payout_deferred {
            tracing::info!("Block(s) confirmed this cycle, payouts deferred to the next one");
            return Ok(report);
        }

        report.payout = Some(self.payouts.run().await?);
        Ok(report)
    }

    /// Deletes shares past retention. Returns how many were removed.
    pub async fn maintenance(&self) -> u64 {
        let age = chrono::Duration::from_std(self.cfg.share_retention).unwrap_or(chrono::Duration::days(7));
        match self.store.prune_shares(Utc::now() - age).await {
            Ok(n) => {
                if n > 0 {
                    tracing::info!(removed = n, "🧹 Purged old shares");
                }
                n
            }
            Err(e) => {
                tracing::warn!(error = %e, "Share purge failed");
                0
            }
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.initial_delay) => {}
            }
            let mut payout_tick = tokio::time::interval(self.cfg.interval);
            let mut maintenance_tick = tokio::time::interval(self.cfg.maintenance_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = payout_tick.tick() => {
                        tracing::info!("🔄 Running payout cycle");
                        match self.run_cycle().await {
                            Ok(_) => {}
                            Err(CycleError::AlreadyRunning) => tracing::debug!("Previous payout cycle still running"),
                            Err(e) => tracing::error!(error = %e, "Payout cycle failed"),
                        }
                    }
                    _ = maintenance_tick.tick() => {
                        self.maintenance().await;
                    }
                }
            }
            tracing::info!("Payout scheduler stopped");
        })
    }
}
