//! PPLNS (Pay Per Last N Shares) split
//!
//! Pure integer arithmetic over the window the store returns:
//! 1. fee = reward × fee_bps / 10 000, net = reward − fee
//! 2. per address: floor(net × work / total work)
//! 3. whatever floor() left over goes to the largest contributor
//! 4. the fee goes to the pool address when one is configured
//!
//! So the rows always sum to `net` (plus `fee` if a pool address exists).

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::storage::{BlockReward, WindowShare};

pub const BPS_DENOMINATOR: u64 = 10_000;

/// Result of a split. `fee + Σ rewards[*].amount` equals the block reward
/// when a pool address is configured; otherwise the fee is not in `rewards`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub rewards: Vec<BlockReward>,
    pub fee: u64,
    pub net: u64,
}

pub fn fee_amount(reward: u64, fee_bps: u32) -> u64 {
    let bps = u128::from(fee_bps.min(BPS_DENOMINATOR as u32));
    (u128::from(reward) * bps / u128::from(BPS_DENOMINATOR)) as u64
}

/// floor(a × b / c) for b ≤ c, falling back to BigUint when a × b overflows.
fn mul_div_floor(a: u64, b: u128, c: u128) -> u64 {
    if c == 0 {
        return 0;
    }
    match u128::from(a).checked_mul(b) {
        Some(p) => (p / c) as u64,
        None => (BigUint::from(a) * BigUint::from(b) / BigUint::from(c))
            .to_u64()
            .unwrap_or(a),
    }
}

/// Adds `fee` to the pool address row, creating it when the pool did
/// not mine in the window.
pub(crate) fn credit_fee(rewards: &mut Vec<BlockReward>, pool_address: Option<&str>, fee: u64) {
    let Some(pool) = pool_address else { return };
    if fee == 0 {
        return;
    }
    match rewards.iter_mut().find(|r| r.address == pool) {
        Some(row) => row.amount += fee,
        None => rewards.push(BlockReward { address: pool.to_string(), amount: fee, share_count: 0 }),
    }
}

pub fn pplns_split(
    shares: &[WindowShare],
    reward: u64,
    fee_bps: u32,
    pool_address: Option<&str>,
) -> Split {
    let fee = fee_amount(reward, fee_bps);
    let net = reward - fee;

    // BTreeMap keeps iteration (and tie-breaking) in address order
    let mut per_address: BTreeMap<&str, (u128, u32)> = BTreeMap::new();
    let mut total: u128 = 0;
    for s in shares {
        let e = per_address.entry(s.address.as_str()).or_insert((0, 0));
        e.0 += u128::from(s.work);
        e.1 += 1;
        total += u128::from(s.work);
    }

    if total == 0 {
        return Split { rewards: Vec::new(), fee, net };
    }

    let mut rewards: Vec<BlockReward> = Vec::with_capacity(per_address.len() + 1);
    let mut distributed: u64 = 0;
    let mut largest: Option<(usize, u128)> = None;
    for (address, (work, count)) in &per_address {
        let amount = mul_div_floor(net, *work, total);
        distributed += amount;
        if largest.map_or(true, |(_, w)| *work > w) {
            largest = Some((rewards.len(), *work));
        }
        rewards.push(BlockReward { address: address.to_string(), amount, share_count: *count });
    }

    if let Some((idx, _)) = largest {
        rewards[idx].amount += net - distributed;
    }

    credit_fee(&mut rewards, pool_address, fee);
    rewards.retain(|r| r.amount > 0);
    rewards.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.address.cmp(&b.address)));

    Split { rewards, fee, net }
}
