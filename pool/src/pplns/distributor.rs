//! Reward distributor: turns a recorded block into reward rows.
//!
//! Used by the block pipeline right after a block is stored and by the
//! confirmer to repair blocks whose rows are missing. Both paths go through
//! `distribute_block`, and the store refuses a second set of rows, so running
//! it twice for a height is harmless.

use std::sync::Arc;

use crate::blockchain::NodeClient;
use crate::error::DistributionError;
use crate::session::MiningMode;
use crate::storage::{Store, WORK_SCALE};

use super::calculator::{pplns_split, Split};
use super::solo::solo_split;

#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub pool_fee_bps: u32,
    pub solo_fee_bps: u32,
    /// Window size as a multiple of the block's network difficulty.
    pub pplns_factor: u64,
    pub pool_address: Option<String>,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self { pool_fee_bps: 100, solo_fee_bps: 150, pplns_factor: 2, pool_address: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    Applied { reward: u64, rows: usize, window_shares: u32 },
    AlreadyDistributed,
}

pub struct RewardDistributor {
    store: Arc<dyn Store>,
    node: Arc<dyn NodeClient>,
    cfg: RewardConfig,
}

impl RewardDistributor {
    pub fn new(store: Arc<dyn Store>, node: Arc<dyn NodeClient>, cfg: RewardConfig) -> Self {
        Self { store, node, cfg }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.cfg
    }

    /// Work the PPLNS window must cover for a block at `network_difficulty`.
    pub fn window_work(&self, network_difficulty: u64) -> u128 {
        u128::from(self.cfg.pplns_factor.max(1))
            * u128::from(network_difficulty.max(1))
            * u128::from(WORK_SCALE)
    }

    pub async fn distribute_block(&self, height: u64) -> Result<DistributionOutcome, DistributionError> {
        let block = self
            .store
            .block(height)
            .await?
            .ok_or(DistributionError::UnknownBlock(height))?;

        if !self.store.block_rewards(height).await?.is_empty() {
            return Ok(DistributionOutcome::AlreadyDistributed);
        }

        let reward = self.node.emission_reward(height).await?;
        let pool_address = self.cfg.pool_address.as_deref();

        let (split, window_shares): (Split, u32) = match block.mode {
            MiningMode::Solo => (
                solo_split(reward, self.cfg.solo_fee_bps, &block.finder_address, pool_address),
                0,
            ),
            MiningMode::Pplns => {
                let window = self.window_work(block.network_difficulty);
                let shares = self.store.pplns_window(window).await?;
                if shares.is_empty() {
                    return Err(DistributionError::EmptyWindow(height));
                }
                let n = u32::try_from(shares.len()).unwrap_or(u32::MAX);
                (pplns_split(&shares, reward, self.cfg.pool_fee_bps, pool_address), n)
            }
        };

        let applied = self
            .store
            .apply_distribution(height, reward, &split.rewards, window_shares)
            .await?;
        if !applied {
            return Ok(DistributionOutcome::AlreadyDistributed);
        }

        tracing::info!(
            height,
            mode = %block.mode,
            reward,
            fee = split.fee,
            rows = split.rewards.len(),
            window_shares,
            "💰 Block reward distributed"
        );
        Ok(DistributionOutcome::Applied { reward, rows: split.rewards.len(), window_shares })
    }
}
