//! In-memory [`Store`] for tests and local development.
//!
//! One mutex guards the whole state, so every trait method is atomic with
//! respect to the others, matching the transactional contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::*;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct StoredShare {
    id: u64,
    share: NewShare,
}

#[derive(Debug, Default)]
struct Miner {
    last_worker: String,
    total_paid: u64,
}

#[derive(Debug, Default)]
struct State {
    next_share_id: u64,
    shares: Vec<StoredShare>,
    miners: HashMap<String, Miner>,
    blocks: BTreeMap<u64, BlockRecord>,
    rewards: BTreeMap<u64, Vec<BlockReward>>,
    balances: HashMap<String, u64>,
    next_payment_id: i64,
    payments: BTreeMap<i64, PaymentRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Test helper: seed a balance directly.
    pub fn credit(&self, address: &str, amount: u64) {
        *self.lock().balances.entry(address.to_string()).or_insert(0) += amount;
    }

    pub fn share_count(&self) -> usize {
        self.lock().shares.len()
    }

    pub fn valid_share_count(&self) -> usize {
        self.lock().shares.iter().filter(|s| s.share.valid).count()
    }

    pub fn payments(&self) -> Vec<PaymentRecord> {
        self.lock().payments.values().cloned().collect()
    }

    pub fn total_paid(&self, address: &str) -> u64 {
        self.lock().miners.get(address).map(|m| m.total_paid).unwrap_or(0)
    }

    pub fn last_worker(&self, address: &str) -> Option<String> {
        self.lock().miners.get(address).map(|m| m.last_worker.clone())
    }
}

fn set_payment_status(
    state: &mut State,
    ids: &[i64],
    from: PaymentStatus,
    to: PaymentStatus,
) -> Vec<PaymentRecord> {
    let mut changed = Vec::new();
    for id in ids {
        if let Some(p) = state.payments.get_mut(id) {
            if p.status == from {
                p.status = to;
                changed.push(p.clone());
            }
        }
    }
    changed
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn record_share(&self, share: &NewShare) -> StoreResult<()> {
        let mut st = self.lock();
        st.next_share_id += 1;
        let id = st.next_share_id;
        st.shares.push(StoredShare { id, share: share.clone() });
        st.miners.entry(share.address.clone()).or_default().last_worker = share.worker.clone();
        Ok(())
    }

    async fn effort_since_last_block(&self, mode: MiningMode, finder: &str) -> StoreResult<f64> {
        let st = self.lock();
        let since = st
            .blocks
            .values()
            .filter(|b| b.mode == mode && (mode == MiningMode::Pplns || b.finder_address == finder))
            .map(|b| b.created_at)
            .max();
        let effort: f64 = st
            .shares
            .iter()
            .map(|s| &s.share)
            .filter(|s| s.valid && s.mode == mode)
            .filter(|s| mode == MiningMode::Pplns || s.address == finder)
            .filter(|s| since.map_or(true, |t| s.created_at > t))
            .filter(|s| s.network_difficulty > 0)
            .map(|s| s.work as f64 / (s.network_difficulty as f64 * WORK_SCALE as f64))
            .sum();
        Ok(effort * 100.0)
    }

    async fn insert_block(&self, block: &NewBlock) -> StoreResult<bool> {
        let mut st = self.lock();
        if st.blocks.contains_key(&block.height) {
            return Ok(false);
        }
        st.blocks.insert(
            block.height,
            BlockRecord {
                height: block.height,
                block_id: block.block_id.clone(),
                reward: 0,
                network_difficulty: block.network_difficulty,
                finder_address: block.finder_address.clone(),
                finder_worker: block.finder_worker.clone(),
                effort_percent: block.effort_percent,
                mode: block.mode,
                status: BlockStatus::Pending,
                pplns_shares: 0,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn block(&self, height: u64) -> StoreResult<Option<BlockRecord>> {
        Ok(self.lock().blocks.get(&height).cloned())
    }

    async fn pplns_window(&self, window_work: u128) -> StoreResult<Vec<WindowShare>> {
        let st = self.lock();
        let mut out = Vec::new();
        let mut acc: u128 = 0;
        let mut shares: Vec<&StoredShare> = st
            .shares
            .iter()
            .filter(|s| s.share.valid && s.share.mode == MiningMode::Pplns && s.share.work > 0)
            .collect();
        shares.sort_by(|a, b| b.id.cmp(&a.id));
        for s in shares {
            if acc >= window_work {
                break;
            }
            acc += s.share.work as u128;
            out.push(WindowShare { address: s.share.address.clone(), work: s.share.work });
        }
        Ok(out)
    }

    async fn block_rewards(&self, height: u64) -> StoreResult<Vec<BlockReward>> {
        Ok(self.lock().rewards.get(&height).cloned().unwrap_or_default())
    }

    async fn apply_distribution(
        &self,
        height: u64,
        reward: u64,
        rewards: &[BlockReward],
        pplns_shares: u32,
    ) -> StoreResult<bool> {
        let mut st = self.lock();
        if st.rewards.get(&height).is_some_and(|r| !r.is_empty()) {
            return Ok(false);
        }
        let block = st
            .blocks
            .get_mut(&height)
            .ok_or_else(|| StoreError::NotFound(format!("block {height}")))?;
        block.reward = reward;
        block.pplns_shares = pplns_shares;
        st.rewards.insert(height, rewards.to_vec());
        Ok(true)
    }

    async fn pending_blocks(&self) -> StoreResult<Vec<BlockRecord>> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.status == BlockStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_block_orphan(&self, height: u64) -> StoreResult<()> {
        if let Some(b) = self.lock().blocks.get_mut(&height) {
            if b.status == BlockStatus::Pending {
                b.status = BlockStatus::Orphan;
            }
        }
        Ok(())
    }

    async fn confirm_block_and_credit(&self, height: u64) -> StoreResult<bool> {
        let mut st = self.lock();
        let pending = st.blocks.get(&height).is_some_and(|b| b.status == BlockStatus::Pending);
        let rewards = st.rewards.get(&height).cloned().unwrap_or_default();
        if !pending || rewards.is_empty() {
            return Ok(false);
        }
        for r in &rewards {
            *st.balances.entry(r.address.clone()).or_insert(0) += r.amount;
        }
        if let Some(b) = st.blocks.get_mut(&height) {
            b.status = BlockStatus::Confirmed;
        }
        Ok(true)
    }

    async fn payable_balances(&self, min: u64, exclude: Option<&str>) -> StoreResult<Vec<Balance>> {
        let st = self.lock();
        let mut out: Vec<Balance> = st
            .balances
            .iter()
            .filter(|(a, amt)| **amt >= min && Some(a.as_str()) != exclude)
            .map(|(a, amt)| Balance { address: a.clone(), amount: *amt })
            .collect();
        out.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.address.cmp(&b.address)));
        Ok(out)
    }

    async fn prepare_payments(&self, entries: &[Balance]) -> StoreResult<Vec<PreparedPayment>> {
        let mut st = self.lock();
        let mut out = Vec::new();
        for e in entries {
            let covered = st.balances.get(&e.address).is_some_and(|b| *b >= e.amount);
            if !covered || e.amount == 0 {
                continue;
            }
            if let Some(b) = st.balances.get_mut(&e.address) {
                *b -= e.amount;
            }
            st.next_payment_id += 1;
            let id = st.next_payment_id;
            st.payments.insert(
                id,
                PaymentRecord {
                    id,
                    address: e.address.clone(),
                    amount: e.amount,
                    status: PaymentStatus::Pending,
                    tx_id: None,
                    error: None,
                    created_at: Utc::now(),
                },
            );
            out.push(PreparedPayment { id, address: e.address.clone(), amount: e.amount });
        }
        Ok(out)
    }

    async fn finalize_payments(&self, ids: &[i64], tx_id: &str) -> StoreResult<()> {
        let mut st = self.lock();
        let sent = set_payment_status(&mut st, ids, PaymentStatus::Pending, PaymentStatus::Sent);
        for p in sent {
            if let Some(rec) = st.payments.get_mut(&p.id) {
                rec.tx_id = Some(tx_id.to_string());
            }
            st.miners.entry(p.address.clone()).or_default().total_paid += p.amount;
        }
        Ok(())
    }

    async fn fail_payments(&self, ids: &[i64], error: &str) -> StoreResult<()> {
        let mut st = self.lock();
        let failed = set_payment_status(&mut st, ids, PaymentStatus::Pending, PaymentStatus::Failed);
        for p in failed {
            *st.balances.entry(p.address.clone()).or_insert(0) += p.amount;
            if let Some(rec) = st.payments.get_mut(&p.id) {
                rec.error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_payments_unknown(&self, ids: &[i64], error: &str) -> StoreResult<()> {
        let mut st = self.lock();
        let unknown = set_payment_status(&mut st, ids, PaymentStatus::Pending, PaymentStatus::Unknown);
        for p in unknown {
            if let Some(rec) = st.payments.get_mut(&p.id) {
                rec.error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn payments_by_status(&self, status: PaymentStatus) -> StoreResult<Vec<PaymentRecord>> {
        Ok(self
            .lock()
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect())
    }

    async fn resolve_unknown_payment(&self, id: i64, resolution: &Resolution) -> StoreResult<bool> {
        let mut st = self.lock();
        let Some(p) = st.payments.get(&id).cloned() else {
            return Ok(false);
        };
        if p.status != PaymentStatus::Unknown {
            return Ok(false);
        }
        match resolution {
            Resolution::Sent { tx_id } => {
                if let Some(rec) = st.payments.get_mut(&id) {
                    rec.status = PaymentStatus::Sent;
                    rec.tx_id = Some(tx_id.clone());
                }
                st.miners.entry(p.address.clone()).or_default().total_paid += p.amount;
            }
            Resolution::NotSent => {
                if let Some(rec) = st.payments.get_mut(&id) {
                    rec.status = PaymentStatus::Failed;
                }
                *st.balances.entry(p.address.clone()).or_insert(0) += p.amount;
            }
        }
        Ok(true)
    }

    async fn balance(&self, address: &str) -> StoreResult<u64> {
        Ok(self.lock().balances.get(address).copied().unwrap_or(0))
    }

    async fn payment(&self, id: i64) -> StoreResult<Option<PaymentRecord>> {
        Ok(self.lock().payments.get(&id).cloned())
    }

    async fn prune_failed_payments(&self, keep: usize) -> StoreResult<u64> {
        let mut st = self.lock();
        let mut per_address: HashMap<String, Vec<i64>> = HashMap::new();
        for p in st.payments.values().filter(|p| p.status == PaymentStatus::Failed) {
            per_address.entry(p.address.clone()).or_default().push(p.id);
        }
        let mut removed = 0;
        for (_, mut ids) in per_address {
            ids.sort_unstable_by(|a, b| b.cmp(a));
            for id in ids.into_iter().skip(keep) {
                st.payments.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn prune_shares(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut st = self.lock();
        let n = st.shares.len();
        st.shares.retain(|s| s.share.created_at >= before);
        Ok((n - st.shares.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(address: &str, work: u64, valid: bool) -> NewShare {
        NewShare {
            address: address.to_string(),
            worker: "rig".to_string(),
            work,
            network_difficulty: 1_000,
            share_difficulty: 20_000,
            height: 10,
            valid,
            mode: MiningMode::Pplns,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn window_walks_most_recent_first_and_includes_boundary_share() {
        let store = MemoryStore::new();
        store.record_share(&share("a", 100, true)).await.unwrap();
        store.record_share(&share("b", 100, true)).await.unwrap();
        store.record_share(&share("x", 500, false)).await.unwrap();
        store.record_share(&share("c", 100, true)).await.unwrap();

        let w = store.pplns_window(150).await.unwrap();
        let addrs: Vec<_> = w.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addrs, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn prepare_skips_uncovered_balances() {
        let store = MemoryStore::new();
        store.credit("a", 10);
        let prepared = store
            .prepare_payments(&[
                Balance { address: "a".into(), amount: 10 },
                Balance { address: "b".into(), amount: 5 },
            ])
            .await
            .unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(store.balance("a").await.unwrap(), 0);
        assert_eq!(store.payment(prepared[0].id).await.unwrap().unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn prune_keeps_newest_failed() {
        let store = MemoryStore::new();
        store.credit("a", 100);
        for _ in 0..7 {
            let p = store.prepare_payments(&[Balance { address: "a".into(), amount: 1 }]).await.unwrap();
            store.fail_payments(&[p[0].id], "HTTP 400").await.unwrap();
        }
        assert_eq!(store.prune_failed_payments(5).await.unwrap(), 2);
        let ids: Vec<i64> = store.payments().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6, 7]);
        assert_eq!(store.balance("a").await.unwrap(), 100);
    }
}
