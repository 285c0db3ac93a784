pub mod calculator;
pub mod distributor;
pub mod solo;

pub use calculator::{fee_amount, pplns_split, Split};
pub use distributor::{DistributionOutcome, RewardConfig, RewardDistributor};
pub use solo::solo_split;
