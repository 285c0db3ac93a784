//! Solo split: the finder takes the whole block minus the solo fee.

use super::calculator::{credit_fee, fee_amount, Split};
use crate::storage::BlockReward;

pub fn solo_split(reward: u64, fee_bps: u32, finder: &str, pool_address: Option<&str>) -> Split {
    let fee = fee_amount(reward, fee_bps);
    let net = reward - fee;
    let mut rewards = vec![BlockReward { address: finder.to_string(), amount: net, share_count: 1 }];
    credit_fee(&mut rewards, pool_address, fee);
    rewards.retain(|r| r.amount > 0);
    Split { rewards, fee, net }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finder_gets_net_and_pool_gets_fee() {
        let s = solo_split(67_500_000_000, 150, "FINDER", Some("POOL"));
        assert_eq!(s.rewards.len(), 2);
        assert_eq!(s.rewards[0].address, "FINDER");
        assert_eq!(s.rewards[0].amount, 66_487_500_000);
        assert_eq!(s.rewards[1].amount, 1_012_500_000);
    }

    #[test]
    fn pool_as_finder_is_one_row() {
        let s = solo_split(1000, 150, "POOL", Some("POOL"));
        assert_eq!(s.rewards.len(), 1);
        assert_eq!(s.rewards[0].amount, 1000);
    }
}
