//! End-to-end pool scenarios against the in-memory store and a scripted node.
//!
//! Share outcomes are made deterministic by computing the Autolykos2 hit for
//! the submitted nonce first and then choosing the candidate's `b` around it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use ergo_pool::blockchain::{MiningCandidate, NodeClient, NodeInfo, PaymentRequest, Solution, WalletClient};
use ergo_pool::error::{CycleError, NodeError, PaymentError, SendError};
use ergo_pool::payout::{
    MaturityTracker, PayoutConfig, PayoutManager, PayoutScheduler, PoolWallet, ScheduleConfig, NANO_ERG,
};
use ergo_pool::pplns::{DistributionOutcome, RewardConfig, RewardDistributor};
use ergo_pool::session::{MiningMode, SharedSession};
use ergo_pool::shares::autolykos;
use ergo_pool::shares::{BlockIdRetry, ShareProcessor, ShareValidator};
use ergo_pool::storage::{
    Balance, BlockRecord, BlockStatus, MemoryStore, NewBlock, NewShare, PaymentStatus, Resolution, Store,
};
use ergo_pool::stratum::{StratumServer, StratumSettings};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MINER: &str = "9fRAWhdxEsTcdb8PhGNrZfwqa65zfkuYHAMmkQLcic1gdLSV5vA";
const MSG: &str = "548c3e602a8f36f8f2738f5f643b02425038044d98543a51cabaa9785e7e864f";
const HEIGHT: u32 = 500_000;
const NET_DIFF: u64 = 1_000_000;
const REWARD: u64 = 67_500_000_000;
const EN2: &str = "000000000001";

struct ScriptedNode {
    info: Mutex<NodeInfo>,
    candidate: Mutex<Option<MiningCandidate>>,
    ids: Mutex<HashMap<u64, Vec<String>>>,
    submitted: Mutex<Vec<Solution>>,
    emission_calls: AtomicUsize,
}

impl ScriptedNode {
    fn new(b: BigUint) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(NodeInfo {
                full_height: u64::from(HEIGHT) - 1,
                headers_height: u64::from(HEIGHT) - 1,
                difficulty: NET_DIFF,
                peers_count: 8,
            }),
            candidate: Mutex::new(Some(MiningCandidate::new(MSG, HEIGHT, b, "02aa").unwrap())),
            ids: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            emission_calls: AtomicUsize::new(0),
        })
    }

    fn set_height(&self, full: u64) {
        let mut info = self.info.lock().unwrap();
        info.full_height = full;
        info.headers_height = full;
    }

    /// Headers far ahead of full blocks.
    fn set_syncing(&self, syncing: bool) {
        let mut info = self.info.lock().unwrap();
        info.headers_height = info.full_height + if syncing { 1_000 } else { 0 };
    }

    fn set_candidate(&self, msg: &str, height: u32, b: BigUint) {
        *self.candidate.lock().unwrap() = Some(MiningCandidate::new(msg, height, b, "02aa").unwrap());
    }

    fn set_ids(&self, height: u64, ids: &[&str]) {
        self.ids
            .lock()
            .unwrap()
            .insert(height, ids.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl NodeClient for ScriptedNode {
    async fn info(&self) -> Result<NodeInfo, NodeError> {
        Ok(self.info.lock().unwrap().clone())
    }

    async fn mining_candidate(&self) -> Result<MiningCandidate, NodeError> {
        self.candidate.lock().unwrap().clone().ok_or(NodeError::Timeout)
    }

    async fn submit_solution(&self, solution: &Solution) -> Result<(), NodeError> {
        self.submitted.lock().unwrap().push(solution.clone());
        Ok(())
    }

    async fn block_ids_at_height(&self, height: u64) -> Result<Vec<String>, NodeError> {
        Ok(self.ids.lock().unwrap().get(&height).cloned().unwrap_or_default())
    }

    async fn emission_reward(&self, _height: u64) -> Result<u64, NodeError> {
        self.emission_calls.fetch_add(1, Ordering::SeqCst);
        Ok(REWARD)
    }
}

#[derive(Clone)]
enum SendOutcome {
    Timeout,
    Rejected(u16, &'static str),
    Sent(&'static str),
}

struct ScriptedWallet {
    outcome: Mutex<SendOutcome>,
    sends: AtomicUsize,
}

impl ScriptedWallet {
    fn new(outcome: SendOutcome) -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(outcome), sends: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl WalletClient for ScriptedWallet {
    async fn unlock(&self, _pass: &str) -> Result<(), NodeError> {
        Ok(())
    }

    async fn lock(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn send_payment(&self, _requests: &[PaymentRequest]) -> Result<String, SendError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.outcome.lock().unwrap().clone() {
            SendOutcome::Timeout => Err(SendError::Ambiguous("request timed out".into())),
            SendOutcome::Rejected(status, body) => Err(SendError::Rejected { status, body: body.into() }),
            SendOutcome::Sent(tx) => Ok(tx.to_string()),
        }
    }
}

/// Holds every send until released, so a cycle can be caught mid-flight.
struct GatedWallet {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl WalletClient for GatedWallet {
    async fn unlock(&self, _pass: &str) -> Result<(), NodeError> {
        Ok(())
    }

    async fn lock(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn send_payment(&self, _requests: &[PaymentRequest]) -> Result<String, SendError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("tx-gated".into())
    }
}

/// Hit of the first session's nonce (extranonce1 "0000") against MSG.
fn expected_hit() -> BigUint {
    let mut header = [0u8; 32];
    hex::decode_to_slice(MSG, &mut header).unwrap();
    let mut nonce = [0u8; 8];
    hex::decode_to_slice(format!("0000{EN2}"), &mut nonce).unwrap();
    BigUint::from_bytes_be(&autolykos::hit(&header, &nonce, HEIGHT))
}

fn initial_difficulty() -> u64 {
    StratumSettings::default().vardiff.initial_difficulty
}

struct Pool {
    server: Arc<StratumServer>,
    store: Arc<MemoryStore>,
    node: Arc<ScriptedNode>,
}

async fn pool_with_target(b: BigUint) -> Pool {
    let store = Arc::new(MemoryStore::new());
    let node = ScriptedNode::new(b);
    let distributor = Arc::new(RewardDistributor::new(store.clone(), node.clone(), RewardConfig::default()));
    let processor = ShareProcessor::new(
        store.clone(),
        node.clone(),
        distributor,
        BlockIdRetry { attempts: 1, delay: Duration::ZERO },
    );
    let server = StratumServer::new(
        StratumSettings::default(),
        node.clone(),
        Arc::new(processor),
        ShareValidator::new(2),
    );
    assert!(server.poll_work().await.unwrap().is_some());
    Pool { server, store, node }
}

fn peer() -> SocketAddr {
    "10.0.0.7:50000".parse().unwrap()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message from server")
        .expect("session channel closed");
    serde_json::from_str(line.trim()).unwrap()
}

async fn send(server: &StratumServer, session: &SharedSession, msg: Value) {
    server.handle_line(session, &msg.to_string()).await;
}

/// Subscribes and authorizes; returns the id of the job received.
async fn login(pool: &Pool, session: &SharedSession, rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    send(&pool.server, session, json!({"id": 1, "method": "mining.subscribe", "params": ["test-miner/1.0"]})).await;
    let sub = next(rx).await;
    assert_eq!(sub["result"][1], json!("0000"));
    assert_eq!(sub["result"][2], json!(6));
    let diff = next(rx).await;
    assert_eq!(diff["method"], json!("mining.set_difficulty"));
    assert_eq!(diff["params"], json!([1]));

    send(&pool.server, session, json!({"id": 2, "method": "mining.authorize", "params": [format!("{MINER}.rig1"), "x"]})).await;
    assert_eq!(next(rx).await["result"], json!(true));
    let notify = next(rx).await;
    assert_eq!(notify["method"], json!("mining.notify"));
    assert_eq!(notify["params"][1], json!(HEIGHT));
    assert_eq!(notify["params"][2], json!(MSG));
    notify["params"][0].as_str().unwrap().to_string()
}

fn submit(job_id: &str, id: u64) -> Value {
    json!({"id": id, "method": "mining.submit", "params": [format!("{MINER}.rig1"), job_id, EN2]})
}

/// The block pipeline runs off the miner's read loop; wait for its row.
async fn wait_for_block(store: &MemoryStore, height: u64) -> BlockRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(block) = store.block(height).await.unwrap() {
                return block;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("block never recorded")
}

// ---------------------------------------------------------------------------
// Session flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_low_difficulty_share_is_rejected_and_session_stays() {
    // share target = 1 × difficulty, far below any real hit
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    send(&pool.server, &session, submit(&job, 3)).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["result"], json!(false));
    assert_eq!(resp["error"]["code"], json!(23));
    assert_eq!(resp["error"]["message"], json!("Low difficulty share"));

    assert!(!session.read().await.is_closed());
    assert_eq!(pool.store.valid_share_count(), 0);
    assert!(pool.node.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_b_valid_share_below_network_target_is_only_recorded() {
    let hit = expected_hit();
    // b ≤ hit < b × difficulty
    let b = &hit / BigUint::from(initial_difficulty() / 2) + 1u8;
    assert!(hit >= b);
    let pool = pool_with_target(b).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    send(&pool.server, &session, submit(&job, 3)).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["result"], json!(true));
    assert_eq!(resp["error"], Value::Null);

    assert_eq!(pool.store.valid_share_count(), 1);
    assert!(pool.node.submitted.lock().unwrap().is_empty());
    assert!(pool.store.block(u64::from(HEIGHT)).await.unwrap().is_none());
    assert_eq!(session.read().await.accepted, 1);
    assert_eq!(pool.server.share_feed().total, 1);
}

#[tokio::test]
async fn scenario_c_block_candidate_is_submitted_recorded_and_distributed_once() {
    let pool = pool_with_target(expected_hit() + 1u8).await;
    pool.node.set_ids(u64::from(HEIGHT), &["b10c"]);
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    send(&pool.server, &session, submit(&job, 3)).await;
    assert_eq!(next(&mut rx).await["result"], json!(true));

    let block = wait_for_block(&pool.store, u64::from(HEIGHT)).await;
    let submitted = pool.node.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].n, format!("0000{EN2}"));
    assert_eq!(submitted[0].pk, "02aa");

    assert_eq!(block.block_id, "b10c");
    assert_eq!(block.status, BlockStatus::Pending);
    assert_eq!(block.finder_address, MINER);
    assert_eq!(block.reward, REWARD);

    let rewards = pool.store.block_rewards(u64::from(HEIGHT)).await.unwrap();
    assert_eq!(rewards.len(), 1);
    assert_eq!(rewards[0].address, MINER);
    assert_eq!(pool.node.emission_calls.load(Ordering::SeqCst), 1);
    assert!(pool.server.share_feed().block_candidates >= 1);
}

#[tokio::test]
async fn resubmitted_nonce_is_a_duplicate() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    send(&pool.server, &session, submit(&job, 3)).await;
    next(&mut rx).await;
    send(&pool.server, &session, submit(&job, 4)).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["error"]["message"], json!("Duplicate share"));
    assert_eq!(pool.store.share_count(), 1);
}

#[tokio::test]
async fn vardiff_change_waits_for_the_next_job() {
    let hit = expected_hit();
    // accepted at the initial difficulty, too hard at the retargeted one
    let b = &hit / BigUint::from(18_000u32) + 1u8;
    let pool = pool_with_target(b.clone()).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    {
        // one share per second against a 15 s target
        let mut s = session.write().await;
        let t0 = Instant::now();
        for i in 0..20 {
            s.vardiff.on_share(t0 + Duration::from_secs(i));
        }
    }
    pool.server.retarget(&session).await;
    {
        let s = session.read().await;
        assert_eq!(s.difficulty, 16_000);
        assert_eq!(s.last_sent_difficulty, initial_difficulty());
    }
    assert!(rx.try_recv().is_err(), "no notify until the next job");

    // still judged against the target the miner was given
    send(&pool.server, &session, submit(&job, 3)).await;
    assert_eq!(next(&mut rx).await["result"], json!(true));

    let msg2 = "00".repeat(32);
    pool.node.set_candidate(&msg2, HEIGHT, b.clone());
    assert!(pool.server.poll_work().await.unwrap().is_some());
    let notify = next(&mut rx).await;
    assert_eq!(notify["method"], json!("mining.notify"));
    assert_ne!(notify["params"][0], json!(job));
    assert_eq!(notify["params"][6], json!((&b * 16_000u32).to_string()));
    assert_eq!(session.read().await.last_sent_difficulty, 16_000);
}

#[tokio::test]
async fn job_updates_pause_while_the_node_is_syncing() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    let msg2 = "11".repeat(32);
    pool.node.set_candidate(&msg2, HEIGHT + 1, BigUint::from(1u8));
    pool.node.set_syncing(true);
    assert!(pool.server.poll_work().await.unwrap().is_none());
    assert!(pool.server.poll_work().await.unwrap().is_none());
    assert!(rx.try_recv().is_err());
    assert_eq!(pool.server.current_job().unwrap().id, job);

    pool.node.set_syncing(false);
    let fresh = pool.server.poll_work().await.unwrap().expect("job after resync");
    assert!(fresh.height_changed);
    let notify = next(&mut rx).await;
    assert_eq!(notify["params"][1], json!(HEIGHT + 1));
    assert_eq!(notify["params"][2], json!(msg2));
    assert_eq!(notify["params"][8], json!(true));
}

#[tokio::test]
async fn submit_before_authorize_is_unauthorized() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Solo).await;
    send(&pool.server, &session, submit("1", 9)).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["error"]["code"], json!(24));
    assert_eq!(resp["id"], json!(9));
}

#[tokio::test]
async fn unknown_job_and_bad_extranonce_are_rejected() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    let job = login(&pool, &session, &mut rx).await;

    send(&pool.server, &session, submit("ffff", 3)).await;
    assert_eq!(next(&mut rx).await["error"]["message"], json!("Job not found"));

    let short = json!({"id": 4, "method": "mining.submit", "params": [MINER, job, "0001"]});
    send(&pool.server, &session, short).await;
    assert_eq!(next(&mut rx).await["error"]["message"], json!("Invalid extraNonce2"));
}

#[tokio::test]
async fn invalid_login_is_refused_and_disconnected() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;
    send(&pool.server, &session, json!({"id": 2, "method": "mining.authorize", "params": ["not-an-address"]})).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["result"], json!(false));
    assert_eq!(resp["error"]["message"], json!("Invalid address"));
    assert!(session.read().await.is_closed());
}

#[tokio::test]
async fn unknown_method_answers_and_garbage_is_ignored() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (session, mut rx, _token) = pool.server.open_session(peer(), MiningMode::Pplns).await;

    pool.server.handle_line(&session, "{definitely not json").await;
    send(&pool.server, &session, json!({"id": 7, "method": "mining.configure", "params": []})).await;
    let resp = next(&mut rx).await;
    assert_eq!(resp["id"], json!(7));
    assert_eq!(resp["error"]["message"], json!("Unknown method"));
    assert!(!session.read().await.is_closed());
}

#[tokio::test]
async fn serve_runs_a_handshake_over_a_byte_stream() {
    let pool = pool_with_target(BigUint::from(1u8)).await;
    let (client, server_side) = tokio::io::duplex(64 * 1024);
    let serving = tokio::spawn(pool.server.clone().serve(server_side, peer(), MiningMode::Solo));

    let (read_half, mut write_half) = tokio::io::split(client);
    let mut lines = BufReader::new(read_half).lines();
    write_half
        .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
        .await
        .unwrap();
    let sub: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(sub["id"], json!(1));
    assert_eq!(sub["result"][0][1][0], json!("mining.notify"));

    let counts = pool.server.session_counts(Some(MiningMode::Solo)).await;
    assert_eq!(counts.connected, 1);
    assert_eq!(counts.authorized, 0);

    drop(write_half);
    drop(lines);
    tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
    assert_eq!(pool.server.session_counts(None).await.connected, 0);
}

// ---------------------------------------------------------------------------
// Payments and confirmation
// ---------------------------------------------------------------------------

fn manager(store: Arc<MemoryStore>, wallet: Arc<ScriptedWallet>) -> PayoutManager {
    PayoutManager::new(store, PoolWallet::new(wallet, Some("secret")), PayoutConfig::default())
}

#[tokio::test]
async fn scenario_d_timed_out_send_halts_payouts_until_resolved() {
    let store = Arc::new(MemoryStore::new());
    store.credit(MINER, 5 * NANO_ERG);
    let wallet = ScriptedWallet::new(SendOutcome::Timeout);
    let payouts = manager(store.clone(), wallet.clone());

    let report = payouts.run().await.unwrap();
    assert_eq!(report.unknown, 1);
    assert_eq!(report.sent, 0);
    // debited, not re-credited
    assert_eq!(store.balance(MINER).await.unwrap(), 0);
    let payments = store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Unknown);

    // next cycle sends nothing
    *wallet.outcome.lock().unwrap() = SendOutcome::Sent("tx1");
    assert!(matches!(payouts.run().await, Err(PaymentError::Halted(1))));
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 1);

    // operator confirms it never went out
    payouts.resolve_unknown(payments[0].id, Resolution::NotSent).await.unwrap();
    assert_eq!(store.balance(MINER).await.unwrap(), 5 * NANO_ERG);
    assert_eq!(store.payment(payments[0].id).await.unwrap().unwrap().status, PaymentStatus::Failed);

    let report = payouts.run().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(store.balance(MINER).await.unwrap(), 0);
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_send_fails_the_payment_and_recredits() {
    let store = Arc::new(MemoryStore::new());
    store.credit(MINER, 3 * NANO_ERG);
    let wallet = ScriptedWallet::new(SendOutcome::Rejected(400, "not enough funds"));
    let payouts = manager(store.clone(), wallet.clone());

    let report = payouts.run().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.unknown, 0);
    let payments = store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert!(payments[0].error.as_deref().unwrap_or("").contains("HTTP 400"));
    assert_eq!(store.balance(MINER).await.unwrap(), 3 * NANO_ERG);

    // a FAILED payment does not halt anything; the balance is paid next run
    *wallet.outcome.lock().unwrap() = SendOutcome::Sent("tx2");
    let report = payouts.run().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(store.balance(MINER).await.unwrap(), 0);
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn interrupted_pending_payment_is_quarantined_and_halts() {
    let store = Arc::new(MemoryStore::new());
    store.credit(MINER, 4 * NANO_ERG);
    // a previous process died between debit and recording the send outcome
    let prepared = store
        .prepare_payments(&[Balance { address: MINER.into(), amount: 4 * NANO_ERG }])
        .await
        .unwrap();
    assert_eq!(prepared.len(), 1);
    store.credit(MINER, 2 * NANO_ERG);

    let wallet = ScriptedWallet::new(SendOutcome::Sent("tx-new"));
    let payouts = manager(store.clone(), wallet.clone());

    assert!(matches!(payouts.run().await, Err(PaymentError::Halted(1))));
    let row = store.payment(prepared[0].id).await.unwrap().unwrap();
    assert_eq!(row.status, PaymentStatus::Unknown);
    assert!(matches!(payouts.run().await, Err(PaymentError::Halted(1))));
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 0);
    assert_eq!(store.balance(MINER).await.unwrap(), 2 * NANO_ERG);

    // operator finds the transaction on chain
    payouts
        .resolve_unknown(prepared[0].id, Resolution::Sent { tx_id: "tx-old".into() })
        .await
        .unwrap();
    let row = store.payment(prepared[0].id).await.unwrap().unwrap();
    assert_eq!(row.status, PaymentStatus::Sent);
    assert_eq!(row.tx_id.as_deref(), Some("tx-old"));

    let report = payouts.run().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 1);
    assert_eq!(store.balance(MINER).await.unwrap(), 0);
}

async fn distributed_block(store: &Arc<MemoryStore>, node: &Arc<ScriptedNode>, height: u64, block_id: &str) {
    store
        .record_share(&NewShare {
            address: MINER.into(),
            worker: "rig1".into(),
            work: 1_000,
            network_difficulty: 1,
            share_difficulty: 1,
            height,
            valid: true,
            mode: MiningMode::Pplns,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .insert_block(&NewBlock {
            height,
            block_id: block_id.into(),
            network_difficulty: 1,
            finder_address: MINER.into(),
            finder_worker: "rig1".into(),
            effort_percent: 100.0,
            mode: MiningMode::Pplns,
        })
        .await
        .unwrap();
    let distributor = RewardDistributor::new(store.clone(), node.clone(), RewardConfig::default());
    assert!(matches!(distributor.distribute_block(height).await.unwrap(), DistributionOutcome::Applied { .. }));
    assert_eq!(distributor.distribute_block(height).await.unwrap(), DistributionOutcome::AlreadyDistributed);
}

fn tracker(store: &Arc<MemoryStore>, node: &Arc<ScriptedNode>) -> MaturityTracker {
    let distributor = Arc::new(RewardDistributor::new(store.clone(), node.clone(), RewardConfig::default()));
    MaturityTracker::new(store.clone(), node.clone(), distributor, 720)
}

#[tokio::test]
async fn scenario_e_non_canonical_block_is_orphaned_and_never_credited() {
    let store = Arc::new(MemoryStore::new());
    let node = ScriptedNode::new(BigUint::from(1u8));
    distributed_block(&store, &node, 100, "ours").await;

    node.set_height(100 + 719);
    let report = tracker(&store, &node).run().await.unwrap();
    assert_eq!(report.waiting, 1);

    node.set_height(100 + 720);
    node.set_ids(100, &["theirs"]);
    let report = tracker(&store, &node).run().await.unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.confirmed, 0);
    assert_eq!(store.block(100).await.unwrap().unwrap().status, BlockStatus::Orphan);
    assert_eq!(store.balance(MINER).await.unwrap(), 0);

    let report = tracker(&store, &node).run().await.unwrap();
    assert_eq!(report.orphaned + report.confirmed, 0);
    assert_eq!(store.balance(MINER).await.unwrap(), 0);
}

#[tokio::test]
async fn confirmer_rebuilds_missing_reward_rows_before_crediting() {
    let store = Arc::new(MemoryStore::new());
    let node = ScriptedNode::new(BigUint::from(1u8));
    store
        .record_share(&NewShare {
            address: MINER.into(),
            worker: "rig1".into(),
            work: 1_000,
            network_difficulty: 1,
            share_difficulty: 1,
            height: 300,
            valid: true,
            mode: MiningMode::Pplns,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    // recorded, but the process died before distribution
    store
        .insert_block(&NewBlock {
            height: 300,
            block_id: "ours".into(),
            network_difficulty: 1,
            finder_address: MINER.into(),
            finder_worker: "rig1".into(),
            effort_percent: 100.0,
            mode: MiningMode::Pplns,
        })
        .await
        .unwrap();
    assert!(store.block_rewards(300).await.unwrap().is_empty());

    node.set_height(300 + 720);
    node.set_ids(300, &["ours"]);
    let report = tracker(&store, &node).run().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.confirmed, 1);
    assert_eq!(store.block_rewards(300).await.unwrap().len(), 1);
    assert_eq!(store.block(300).await.unwrap().unwrap().status, BlockStatus::Confirmed);
    assert_eq!(store.balance(MINER).await.unwrap(), REWARD - REWARD / 100);
    assert_eq!(node.emission_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn overlapping_cycles_are_refused() {
    let store = Arc::new(MemoryStore::new());
    store.credit(MINER, 2 * NANO_ERG);
    let node = ScriptedNode::new(BigUint::from(1u8));
    let wallet = Arc::new(GatedWallet { entered: Notify::new(), release: Notify::new() });
    let scheduler = Arc::new(PayoutScheduler::new(
        tracker(&store, &node),
        PayoutManager::new(store.clone(), PoolWallet::new(wallet.clone(), Some("secret")), PayoutConfig::default()),
        store.clone(),
        ScheduleConfig::default(),
    ));

    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_cycle().await }
    });
    tokio::time::timeout(Duration::from_secs(5), wallet.entered.notified())
        .await
        .expect("first cycle never reached the wallet");

    assert!(scheduler.is_running());
    assert!(matches!(scheduler.run_cycle().await, Err(CycleError::AlreadyRunning)));
    assert!(matches!(scheduler.trigger().await, Err(CycleError::AlreadyRunning)));

    wallet.release.notify_one();
    let report = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.payout.unwrap().sent, 1);
    assert!(!scheduler.is_running());
    assert!(scheduler.run_cycle().await.is_ok());
}

#[tokio::test]
async fn only_maintenance_prunes_old_shares() {
    let store = Arc::new(MemoryStore::new());
    store.credit(MINER, 2 * NANO_ERG);
    let node = ScriptedNode::new(BigUint::from(1u8));
    for age_days in [0, 3, 8, 40] {
        store
            .record_share(&NewShare {
                address: MINER.into(),
                worker: "rig1".into(),
                work: 1_000,
                network_difficulty: 1,
                share_difficulty: 1,
                height: 10,
                valid: true,
                mode: MiningMode::Pplns,
                created_at: Utc::now() - chrono::Duration::days(age_days),
            })
            .await
            .unwrap();
    }
    let wallet = ScriptedWallet::new(SendOutcome::Sent("tx"));
    let scheduler = PayoutScheduler::new(
        tracker(&store, &node),
        manager(store.clone(), wallet.clone()),
        store.clone(),
        ScheduleConfig::default(),
    );

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.payout.unwrap().sent, 1);
    assert_eq!(store.share_count(), 4);

    assert_eq!(scheduler.maintenance().await, 2);
    assert_eq!(store.share_count(), 2);
}

#[tokio::test]
async fn confirming_cycle_defers_payouts_to_the_next_one() {
    let store = Arc::new(MemoryStore::new());
    let node = ScriptedNode::new(BigUint::from(1u8));
    distributed_block(&store, &node, 200, "ours").await;
    node.set_height(200 + 720);
    node.set_ids(200, &["ours"]);

    let wallet = ScriptedWallet::new(SendOutcome::Sent("tx-paid"));
    let scheduler = PayoutScheduler::new(
        tracker(&store, &node),
        manager(store.clone(), wallet.clone()),
        store.clone(),
        ScheduleConfig::default(),
    );

    let first = scheduler.run_cycle().await.unwrap();
    assert_eq!(first.maturity.unwrap().confirmed, 1);
    assert!(first.payout_deferred);
    assert!(first.payout.is_none());
    // 1 % fee stays unassigned without a pool address
    let credited = REWARD - REWARD / 100;
    assert_eq!(store.balance(MINER).await.unwrap(), credited);
    assert_eq!(wallet.sends.load(Ordering::SeqCst), 0);

    let second = scheduler.run_cycle().await.unwrap();
    assert!(!second.payout_deferred);
    assert_eq!(second.payout.unwrap().sent, 1);
    assert_eq!(store.total_paid(MINER), credited);
    assert!(!scheduler.is_running());
}
