//! Block maturity tracker
//!
//! Blocks stay PENDING until they are `confirmations` deep. Then:
//! - not on the canonical chain → ORPHAN (terminal, never credited)
//! - canonical → reward rows are repaired if missing, then balances are
//!   credited and the block becomes CONFIRMED in one store transaction
//!
//! A node error while checking a block leaves it PENDING for the next cycle.

use std::sync::Arc;

use serde::Serialize;

use crate::blockchain::NodeClient;
use crate::error::CycleError;
use crate::metrics::prometheus as metrics;
use crate::pplns::RewardDistributor;
use crate::storage::{BlockRecord, Store};

/// Ergo coinbase outputs unlock after 720 blocks.
pub const DEFAULT_CONFIRMATIONS: u64 = 720;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaturityReport {
    pub confirmed: u32,
    pub orphaned: u32,
    pub waiting: u32,
    pub skipped: u32,
    pub repaired: u32,
}

pub struct MaturityTracker {
    store: Arc<dyn Store>,
    node: Arc<dyn NodeClient>,
    distributor: Arc<RewardDistributor>,
    confirmations: u64,
}

impl MaturityTracker {
    pub fn new(
        store: Arc<dyn Store>,
        node: Arc<dyn NodeClient>,
        distributor: Arc<RewardDistributor>,
        confirmations: u64,
    ) -> Self {
        Self { store, node, distributor, confirmations }
    }

    pub async fn run(&self) -> Result<MaturityReport, CycleError> {
        let current_height = self.node.info().await?.full_height;
        let pending = self.store.pending_blocks().await?;
        let mut report = MaturityReport::default();

        for block in &pending {
            if current_height < block.height.saturating_add(self.confirmations) {
                report.waiting += 1;
                continue;
            }
            if let Err(e) = self.settle(block, &mut report).await {
                report.skipped += 1;
                tracing::warn!(height = block.height, error = %e, "Block check failed, retrying next cycle");
            }
        }

        if report.confirmed + report.orphaned > 0 {
            tracing::info!(
                current_height,
                confirmed = report.confirmed,
                orphaned = report.orphaned,
                waiting = report.waiting,
                "✅ Maturity check complete"
            );
        }
        Ok(report)
    }

    async fn settle(&self, block: &BlockRecord, report: &mut MaturityReport) -> Result<(), CycleError> {
        let height = block.height;
        let ids = self.node.block_ids_at_height(height).await?;
        // A placeholder id can only be checked for "something exists there".
        let canonical = if block.has_placeholder_id() {
            !ids.is_empty()
        } else {
            ids.iter().any(|id| id == &block.block_id)
        };

        if !canonical {
            self.store.mark_block_orphan(height).await?;
            metrics::inc_blocks_orphaned();
            report.orphaned += 1;
            tracing::warn!(height, block_id = %block.block_id, "⚠️ Block orphaned");
            return Ok(());
        }

        if self.store.block_rewards(height).await?.is_empty() {
            tracing::error!(height, "Confirmed block has no reward rows, redistributing");
            if let Err(e) = self.distributor.distribute_block(height).await {
                tracing::error!(height, error = %e, "Reward repair failed, block stays pending");
                report.skipped += 1;
                return Ok(());
            }
            report.repaired += 1;
        }

        if self.store.confirm_block_and_credit(height).await? {
            metrics::inc_blocks_confirmed();
            report.confirmed += 1;
            tracing::info!(height, block_id = %block.block_id, "Block confirmed, balances credited");
        } else {
            tracing::error!(height, "Block could not be confirmed (no reward rows)");
            report.skipped += 1;
        }
        Ok(())
    }
}
