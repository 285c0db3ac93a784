//! Payout manager: moves confirmed balances to miners' wallets.
//!
//! Each payment row is a small state machine:
//!
//! ```text
//! PENDING ──2xx──────────► SENT
//!    │────explicit error──► FAILED (balance re-credited)
//!    └────timeout/transport► UNKNOWN (balance stays debited)
//! ```
//!
//! Any UNKNOWN row halts every later run until an operator resolves it with
//! [`PayoutManager::resolve_unknown`]. Nothing is ever re-sent automatically.

use std::sync::Arc;
use serde::Serialize;

use super::wallet::PoolWallet;
use crate::error::{PaymentError, SendError};
use crate::metrics::prometheus as metrics;
use crate::storage::{Balance, PaymentRecord, PaymentStatus, Resolution, Store};

// Ergo uses 9 decimal places (1 ERG = 1,000,000,000 nanoERG)
pub const NANO_ERG: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub min_payout: u64,
    pub max_per_batch: usize,
    /// Never paid out; holds the pool's fee.
    pub pool_address: Option<String>,
    /// FAILED rows kept per address.
    pub failed_keep: usize,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            min_payout: NANO_ERG,
            max_per_batch: 20,
            pool_address: None,
            failed_keep: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutReport {
    pub sent: u32,
    pub failed: u32,
    pub unknown: u32,
    pub batches: u32,
    /// No wallet password configured
    pub disabled: bool,
}

pub struct PayoutManager {
    store: Arc<dyn Store>,
    wallet: Option<PoolWallet>,
    cfg: PayoutConfig,
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn nano_to_erg(amount: u64) -> f64 {
    amount as f64 / NANO_ERG as f64
}

impl PayoutManager {
    pub fn new(store: Arc<dyn Store>, wallet: Option<PoolWallet>, cfg: PayoutConfig) -> Self {
        if wallet.is_none() {
            tracing::warn!("No wallet password configured, automatic payouts disabled");
        }
        Self { store, wallet, cfg }
    }

    pub async fn run(&self) -> Result<PayoutReport, PaymentError> {
        let Some(wallet) = &self.wallet else {
            return Ok(PayoutReport { disabled: true, ..Default::default() });
        };

        self.quarantine_interrupted().await?;

        let unknown = self.store.payments_by_status(PaymentStatus::Unknown).await?;
        metrics::set_unknown_payments(unknown.len());
        if !unknown.is_empty() {
            let ids: Vec<i64> = unknown.iter().map(|p| p.id).collect();
            tracing::error!(count = unknown.len(), ?ids, "🛑 Payments in UNKNOWN state, payouts halted until resolved");
            return Err(PaymentError::Halted(unknown.len() as u64));
        }

        let payable = self
            .store
            .payable_balances(self.cfg.min_payout, self.cfg.pool_address.as_deref())
            .await?;
        let mut report = PayoutReport::default();
        if payable.is_empty() {
            self.housekeeping().await;
            return Ok(report);
        }

        wallet.unlock().await?;
        tracing::info!(miners = payable.len(), "📤 Processing payouts");

        for chunk in payable.chunks(self.cfg.max_per_batch.max(1)) {
            report.batches += 1;
            if !self.send_batch(wallet, chunk, &mut report).await {
                break;
            }
        }

        wallet.lock().await;
        self.housekeeping().await;

        tracing::info!(
            sent = report.sent,
            failed = report.failed,
            unknown = report.unknown,
            "Payout run complete"
        );
        Ok(report)
    }

    /// Returns false when the run must stop (an outcome became UNKNOWN).
    async fn send_batch(&self, wallet: &PoolWallet, chunk: &[Balance], report: &mut PayoutReport) -> bool {
        let prepared = match self.store.prepare_payments(chunk).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare payment batch");
                report.failed += count(chunk.len());
                return true;
            }
        };
        if prepared.is_empty() {
            return true;
        }

        let ids: Vec<i64> = prepared.iter().map(|p| p.id).collect();
        let total: u64 = prepared.iter().map(|p| p.amount).sum();
        let n = count(prepared.len());

        match wallet.send(&prepared).await {
            Ok(tx_id) => {
                if let Err(e) = self.store.finalize_payments(&ids, &tx_id).await {
                    // rows stay PENDING and get quarantined on the next run
                    tracing::error!(%tx_id, ?ids, error = %e, "Payment sent but could not be marked SENT");
                }
                report.sent += n;
                metrics::inc_payments("sent", u64::from(n));
                tracing::info!(%tx_id, payments = n, erg = nano_to_erg(total), "✅ Payment batch sent");
                true
            }
            Err(SendError::Rejected { status, body }) => {
                let reason = format!("HTTP {status}: {body}");
                if let Err(e) = self.store.fail_payments(&ids, &reason).await {
                    tracing::error!(?ids, error = %e, "Could not mark rejected payments FAILED");
                }
                report.failed += n;
                metrics::inc_payments("failed", u64::from(n));
                tracing::warn!(status, payments = n, "❌ Wallet rejected payment batch, balances re-credited");
                true
            }
            Err(SendError::Ambiguous(reason)) => {
                if let Err(e) = self.store.mark_payments_unknown(&ids, &reason).await {
                    tracing::error!(?ids, error = %e, "Could not mark payments UNKNOWN");
                }
                report.unknown += n;
                metrics::inc_payments("unknown", u64::from(n));
                tracing::error!(
                    ?ids,
                    erg = nano_to_erg(total),
                    %reason,
                    "🛑 Payment outcome unknown, payouts halted until an operator resolves it"
                );
                false
            }
        }
    }

    /// PENDING rows at the start of a run belong to a run that never
    /// recorded its outcome.
    async fn quarantine_interrupted(&self) -> Result<(), PaymentError> {
        let pending = self.store.payments_by_status(PaymentStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = pending.iter().map(|p| p.id).collect();
        tracing::error!(?ids, "Found PENDING payments from an interrupted run, marking UNKNOWN");
        self.store
            .mark_payments_unknown(&ids, "interrupted before the send outcome was recorded")
            .await?;
        Ok(())
    }

    pub async fn unknown_payments(&self) -> Result<Vec<PaymentRecord>, PaymentError> {
        Ok(self.store.payments_by_status(PaymentStatus::Unknown).await?)
    }

    /// Operator action for a payment stuck in UNKNOWN.
    pub async fn resolve_unknown(&self, id: i64, resolution: Resolution) -> Result<(), PaymentError> {
        if !self.store.resolve_unknown_payment(id, &resolution).await? {
            return Err(PaymentError::NotUnknown(id));
        }
        let remaining = self.store.payments_by_status(PaymentStatus::Unknown).await?;
        metrics::set_unknown_payments(remaining.len());
        tracing::info!(id, ?resolution, remaining = remaining.len(), "UNKNOWN payment resolved");
        Ok(())
    }

    async fn housekeeping(&self) {
        match self.store.prune_failed_payments(self.cfg.failed_keep).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(removed = n, "Pruned old failed payments"),
            Err(e) => tracing::warn!(error = %e, "Failed payment cleanup failed"),
        }
    }
}
