//! Persistent store collaborator.
//!
//! Every multi-row state change is one method on [`Store`] so backends can
//! make it a single transaction: distribution + block update, confirm +
//! credit, debit + payment creation, refund + fail, resolve.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreResult;
use crate::session::MiningMode;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Proven work is stored in fixed-point milli-units so that shares at a
/// multiplier above the network difficulty still count.
pub const WORK_SCALE: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct NewShare {
    pub address: String,
    pub worker: String,
    /// Milli-units of network difficulty proven by this share
    pub work: u64,
    pub network_difficulty: u64,
    /// Session multiplier the share was validated against
    pub share_difficulty: u64,
    pub height: u64,
    pub valid: bool,
    pub mode: MiningMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowShare {
    pub address: String,
    pub work: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Confirmed,
    Orphan,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Confirmed => "confirmed",
            BlockStatus::Orphan => "orphan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BlockStatus::Pending),
            "confirmed" => Some(BlockStatus::Confirmed),
            "orphan" => Some(BlockStatus::Orphan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBlock {
    pub height: u64,
    pub block_id: String,
    pub network_difficulty: u64,
    pub finder_address: String,
    pub finder_worker: String,
    pub effort_percent: f64,
    pub mode: MiningMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockRecord {
    pub height: u64,
    pub block_id: String,
    /// Zero until distribution has run
    pub reward: u64,
    pub network_difficulty: u64,
    pub finder_address: String,
    pub finder_worker: String,
    pub effort_percent: f64,
    pub mode: MiningMode,
    pub status: BlockStatus,
    pub pplns_shares: u32,
    pub created_at: DateTime<Utc>,
}

impl BlockRecord {
    pub fn has_placeholder_id(&self) -> bool {
        self.block_id.starts_with(UNKNOWN_BLOCK_ID_PREFIX)
    }
}

pub const UNKNOWN_BLOCK_ID_PREFIX: &str = "unknown_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReward {
    pub address: String,
    pub amount: u64,
    pub share_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Sent,
    Failed,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Sent => "sent",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "sent" => Some(PaymentStatus::Sent),
            "failed" => Some(PaymentStatus::Failed),
            "unknown" => Some(PaymentStatus::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub address: String,
    pub amount: u64,
    pub status: PaymentStatus,
    pub tx_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A payment created in PENDING together with its balance debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPayment {
    pub id: i64,
    pub address: String,
    pub amount: u64,
}

/// Operator decision for a payment stuck in UNKNOWN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The transaction is on chain.
    Sent { tx_id: String },
    /// The transaction never went out; the balance is re-credited.
    NotSent,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Appends the share and upserts the miner row.
    async fn record_share(&self, share: &NewShare) -> StoreResult<()>;

    /// Effort (percent) of valid shares since the previous block: the pool's
    /// last PPLNS block, or for solo this finder's last solo block.
    async fn effort_since_last_block(&self, mode: MiningMode, finder: &str) -> StoreResult<f64>;

    /// Idempotent on height. Returns false if the block already existed.
    async fn insert_block(&self, block: &NewBlock) -> StoreResult<bool>;

    async fn block(&self, height: u64) -> StoreResult<Option<BlockRecord>>;

    /// Valid PPLNS shares, most recent first, until cumulative work reaches
    /// `window_work` (the share crossing the boundary is included).
    async fn pplns_window(&self, window_work: u128) -> StoreResult<Vec<WindowShare>>;

    async fn block_rewards(&self, height: u64) -> StoreResult<Vec<BlockReward>>;

    /// Inserts reward rows and sets the block's reward in one transaction.
    /// A block that already has reward rows is left untouched (returns false).
    async fn apply_distribution(
        &self,
        height: u64,
        reward: u64,
        rewards: &[BlockReward],
        pplns_shares: u32,
    ) -> StoreResult<bool>;

    async fn pending_blocks(&self) -> StoreResult<Vec<BlockRecord>>;

    /// Pending → orphan. Terminal.
    async fn mark_block_orphan(&self, height: u64) -> StoreResult<()>;

    /// Credits every reward row to its balance and marks the block confirmed,
    /// atomically. Returns false if the block was not pending or has no rewards.
    async fn confirm_block_and_credit(&self, height: u64) -> StoreResult<bool>;

    /// Balances ≥ `min`, largest first, optionally excluding one address.
    async fn payable_balances(&self, min: u64, exclude: Option<&str>) -> StoreResult<Vec<Balance>>;

    /// For each entry whose balance still covers the amount: debit it and
    /// create a PENDING payment, all in one transaction.
    async fn prepare_payments(&self, entries: &[Balance]) -> StoreResult<Vec<PreparedPayment>>;

    /// PENDING → SENT with `tx_id`; adds to the miners' total paid.
    async fn finalize_payments(&self, ids: &[i64], tx_id: &str) -> StoreResult<()>;

    /// PENDING → FAILED and re-credit the balances, atomically.
    async fn fail_payments(&self, ids: &[i64], error: &str) -> StoreResult<()>;

    /// PENDING → UNKNOWN. Balances are not touched.
    async fn mark_payments_unknown(&self, ids: &[i64], error: &str) -> StoreResult<()>;

    async fn payments_by_status(&self, status: PaymentStatus) -> StoreResult<Vec<PaymentRecord>>;

    /// Clears one UNKNOWN payment. Returns false if it was not UNKNOWN.
    async fn resolve_unknown_payment(&self, id: i64, resolution: &Resolution) -> StoreResult<bool>;

    async fn balance(&self, address: &str) -> StoreResult<u64>;

    async fn payment(&self, id: i64) -> StoreResult<Option<PaymentRecord>>;

    /// Keeps at most `keep` FAILED payments per address (newest).
    async fn prune_failed_payments(&self, keep: usize) -> StoreResult<u64>;

    async fn prune_shares(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}
