//! Ergo node collaborator
//!
//! The pool only needs a narrow slice of the node REST API: sync status,
//! mining candidates, solution submission, block listings, emission and the
//! wallet payment endpoints.

pub mod rpc_client;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, SendError};

pub use rpc_client::ErgoNodeClient;

/// Headers-vs-full-blocks gap under which the node counts as synced.
pub const SYNC_TOLERANCE: u64 = 5;

/// Fixed `w` of an Autolykos2 solution (secp256k1 generator point).
pub const SOLUTION_W: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub full_height: u64,
    pub headers_height: u64,
    pub difficulty: u64,
    pub peers_count: u32,
}

impl NodeInfo {
    pub fn is_synced(&self) -> bool {
        self.headers_height > 0
            && self.full_height > 0
            && self.headers_height.saturating_sub(self.full_height) < SYNC_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningCandidate {
    /// Header digest, lowercase hex
    pub msg: String,
    pub header: [u8; 32],
    pub height: u32,
    /// `b` from the node
    pub network_target: BigUint,
    pub pk: String,
}

impl MiningCandidate {
    pub fn new(msg: &str, height: u32, network_target: BigUint, pk: &str) -> Result<Self, NodeError> {
        let msg = msg.to_ascii_lowercase();
        let mut header = [0u8; 32];
        hex::decode_to_slice(&msg, &mut header)
            .map_err(|e| NodeError::Decode(format!("candidate msg: {e}")))?;
        Ok(Self {
            msg,
            header,
            height,
            network_target,
            pk: pk.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Solution {
    pub pk: String,
    pub w: String,
    /// extranonce1 ‖ extranonce2, 16 hex chars
    pub n: String,
    pub d: u64,
}

impl Solution {
    pub fn new(pk: &str, nonce_hex: &str) -> Self {
        Self {
            pk: pk.to_string(),
            w: SOLUTION_W.to_string(),
            n: nonce_hex.to_string(),
            d: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentRequest {
    pub address: String,
    /// nanoERG
    pub value: u64,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn info(&self) -> Result<NodeInfo, NodeError>;

    async fn mining_candidate(&self) -> Result<MiningCandidate, NodeError>;

    /// `Ok(())` when the node accepted the solution.
    async fn submit_solution(&self, solution: &Solution) -> Result<(), NodeError>;

    async fn block_ids_at_height(&self, height: u64) -> Result<Vec<String>, NodeError>;

    /// Miner reward (nanoERG) for a block at `height`.
    async fn emission_reward(&self, height: u64) -> Result<u64, NodeError>;
}

#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn unlock(&self, pass: &str) -> Result<(), NodeError>;

    async fn lock(&self) -> Result<(), NodeError>;

    /// Exactly one request. Returns the transaction id.
    async fn send_payment(&self, requests: &[PaymentRequest]) -> Result<String, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_requires_small_header_gap() {
        let mut info = NodeInfo { full_height: 100, headers_height: 104, difficulty: 1, peers_count: 3 };
        assert!(info.is_synced());
        info.headers_height = 105;
        assert!(!info.is_synced());
        info.full_height = 0;
        assert!(!info.is_synced());
    }

    #[test]
    fn candidate_rejects_bad_digest() {
        assert!(MiningCandidate::new("zz", 1, BigUint::from(1u8), "pk").is_err());
        let c = MiningCandidate::new(&"AB".repeat(32), 1, BigUint::from(1u8), "pk").unwrap();
        assert_eq!(c.msg, "ab".repeat(32));
        assert_eq!(c.header, [0xab; 32]);
    }

    #[test]
    fn solution_uses_fixed_w_and_zero_d() {
        let v = serde_json::to_value(Solution::new("02aa", "0001000000000005")).unwrap();
        assert_eq!(v["w"], SOLUTION_W);
        assert_eq!(v["d"], 0);
        assert_eq!(v["n"], "0001000000000005");
    }
}
