//! Share processing pipeline
//!
//! Accepted shares are persisted here; shares that also meet the network
//! target go through the block pipeline:
//! 1. submit the solution to the node
//! 2. compute effort since the previous block
//! 3. resolve the block id (bounded retries, placeholder on failure)
//! 4. record the block (idempotent on height)
//! 5. distribute the reward
//! 6. fire the optional notifier

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::blockchain::{NodeClient, Solution};
use crate::metrics::prometheus as metrics;
use crate::notify::{BlockFoundEvent, BlockNotifier};
use crate::pplns::RewardDistributor;
use crate::session::MiningMode;
use crate::storage::{NewBlock, NewShare, Store, UNKNOWN_BLOCK_ID_PREFIX, WORK_SCALE};

#[derive(Debug, Clone, Copy)]
pub struct BlockIdRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for BlockIdRetry {
    fn default() -> Self {
        Self { attempts: 5, delay: Duration::from_secs(2) }
    }
}

/// A share whose hit met the network target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundBlock {
    pub height: u32,
    /// Full nonce, 16 hex chars
    pub nonce: String,
    pub pk: String,
    pub address: String,
    pub worker: String,
    pub mode: MiningMode,
    pub network_difficulty: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// The node refused the solution; nothing was recorded.
    Rejected,
    /// Accepted by the node but the block row could not be written.
    Unrecorded,
    Recorded { block_id: String, effort_percent: f64, distributed: bool },
}

/// floor(network difficulty × WORK_SCALE / share multiplier), at least 1.
pub fn proven_work(network_difficulty: u64, share_difficulty: u64) -> u64 {
    let w = u128::from(network_difficulty) * u128::from(WORK_SCALE) / u128::from(share_difficulty.max(1));
    u64::try_from(w).unwrap_or(u64::MAX).max(1)
}

pub struct ShareProcessor {
    store: Arc<dyn Store>,
    node: Arc<dyn NodeClient>,
    distributor: Arc<RewardDistributor>,
    notifier: Option<Arc<dyn BlockNotifier>>,
    block_id_retry: BlockIdRetry,
}

impl ShareProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        node: Arc<dyn NodeClient>,
        distributor: Arc<RewardDistributor>,
        block_id_retry: BlockIdRetry,
    ) -> Self {
        Self { store, node, distributor, notifier: None, block_id_retry }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn BlockNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Persists a share. Store failures are logged; the miner's reply does
    /// not depend on them.
    pub async fn record_share(&self, share: &NewShare) -> bool {
        match self.store.record_share(share).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(address = %share.address, valid = share.valid, error = %e, "Failed to record share");
                false
            }
        }
    }

    pub async fn handle_block(&self, found: &FoundBlock) -> BlockOutcome {
        metrics::inc_block_submit_attempts();
        tracing::info!(
            height = found.height,
            nonce = %found.nonce,
            miner = %found.address,
            worker = %found.worker,
            mode = %found.mode,
            "🎯 Block candidate found, submitting"
        );

        if let Err(e) = self.node.submit_solution(&Solution::new(&found.pk, &found.nonce)).await {
            metrics::inc_block_submit_rejected();
            tracing::error!(height = found.height, error = %e, "❌ Node rejected block solution");
            return BlockOutcome::Rejected;
        }
        metrics::inc_blocks_found();
        tracing::info!(height = found.height, "✅ Block accepted by node");

        let height = u64::from(found.height);
        let effort_percent = match self.store.effort_since_last_block(found.mode, &found.address).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(height, error = %e, "Effort calculation failed, recording 0");
                0.0
            }
        };

        let block_id = self.resolve_block_id(height).await;
        let block = NewBlock {
            height,
            block_id: block_id.clone(),
            network_difficulty: found.network_difficulty,
            finder_address: found.address.clone(),
            finder_worker: found.worker.clone(),
            effort_percent,
            mode: found.mode,
        };
        match self.store.insert_block(&block).await {
            Ok(true) => tracing::info!(height, %block_id, effort = format!("{effort_percent:.2}%"), "📦 Block recorded"),
            Ok(false) => tracing::warn!(height, "Block already recorded"),
            Err(e) => {
                tracing::error!(height, %block_id, error = %e, "Block accepted by node but could not be recorded");
                return BlockOutcome::Unrecorded;
            }
        }

        let distributed = match self.distributor.distribute_block(height).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(height, error = %e, "Reward distribution failed, confirmer will retry");
                false
            }
        };

        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            let event = BlockFoundEvent {
                height,
                block_id: block_id.clone(),
                mode: found.mode,
                finder_address: found.address.clone(),
                finder_worker: found.worker.clone(),
                effort_percent,
                found_at: Utc::now(),
            };
            tokio::spawn(async move {
                if let Err(e) = notifier.block_found(&event).await {
                    tracing::warn!(height = event.height, error = %e, "Block notification failed");
                }
            });
        }

        BlockOutcome::Recorded { block_id, effort_percent, distributed }
    }

    /// The node may not index a freshly accepted block right away.
    async fn resolve_block_id(&self, height: u64) -> String {
        let attempts = self.block_id_retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.node.block_ids_at_height(height).await {
                Ok(ids) if !ids.is_empty() => return ids[0].clone(),
                Ok(_) => tracing::debug!(height, attempt, "Block id not indexed yet"),
                Err(e) => tracing::debug!(height, attempt, error = %e, "Block id lookup failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.block_id_retry.delay).await;
            }
        }
        tracing::warn!(height, "Block id unresolved, storing placeholder");
        format!("{UNKNOWN_BLOCK_ID_PREFIX}{height}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proven_work_is_fixed_point_and_floored_at_one() {
        assert_eq!(proven_work(1_000_000, 20_000), 50_000);
        // multiplier above network difficulty still proves something
        assert_eq!(proven_work(1_000, 2_000), 500);
        assert_eq!(proven_work(1, 1_000_000), 1);
        assert_eq!(proven_work(0, 5), 1);
        assert_eq!(proven_work(u64::MAX, 1), u64::MAX);
    }
}
