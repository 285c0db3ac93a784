//! Autolykos2 share validation (CPU reference).
//!
//! Consensus rule; the output must match the Ergo node bit for bit. Only the
//! table size N depends on height, the `M` buffer is the same for every block.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;

type Blake2b256 = Blake2b<U32>;

/// Number of table elements summed per hash
pub const K: usize = 32;
/// Base table size 2^26
pub const N_BASE: u32 = 1 << 26;
pub const INCREASE_START: u32 = 600 * 1024;
pub const INCREASE_PERIOD: u32 = 50 * 1024;
pub const N_INCREASE_HEIGHT_MAX: u32 = 4_198_400;
pub const N_MAX: u32 = 2_147_387_550;

const M_SIZE: usize = 1024 * 8;

/// 1024 big-endian u64 values 0..1023
static M: [u8; M_SIZE] = build_m();

const fn build_m() -> [u8; M_SIZE] {
    let mut m = [0u8; M_SIZE];
    let mut i = 0;
    while i < 1024 {
        let bytes = (i as u64).to_be_bytes();
        let mut k = 0;
        while k < 8 {
            m[i * 8 + k] = bytes[k];
            k += 1;
        }
        i += 1;
    }
    m
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Final hash below the share target
    pub valid: bool,
    /// Final hash below the network target (block candidate)
    pub meets_network_target: bool,
    pub final_hash: BigUint,
}

/// Table size N for a block height.
pub fn calc_n(height: u32) -> u32 {
    if height < INCREASE_START {
        return N_BASE;
    }
    if height >= N_INCREASE_HEIGHT_MAX {
        return N_MAX;
    }
    let iterations = (height - INCREASE_START) / INCREASE_PERIOD + 1;
    let mut n = N_BASE;
    for _ in 0..iterations {
        n = n / 100 * 105;
    }
    n
}

fn blake2b256(data: &[u8]) -> [u8; 32] {
    Blake2b256::digest(data).into()
}

/// blake2b256(idx || height || M) without its first byte, left-padded to 32.
fn table_element(idx: u32, height: u32) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(idx.to_be_bytes());
    hasher.update(height.to_be_bytes());
    hasher.update(&M[..]);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut elem = [0u8; 32];
    elem[1..].copy_from_slice(&digest[1..]);
    elem
}

fn add_be32_in_place(acc: &mut [u8; 32], x: &[u8; 32]) {
    let mut carry = 0u16;
    for i in (0..32).rev() {
        let sum = acc[i] as u16 + x[i] as u16 + carry;
        acc[i] = sum as u8;
        carry = sum >> 8;
    }
}

/// Final hash of `header || nonce` at `height`, as 32 big-endian bytes.
pub fn hit(header: &[u8; 32], nonce: &[u8; 8], height: u32) -> [u8; 32] {
    let n = calc_n(height);

    let mut coinbase = [0u8; 40];
    coinbase[..32].copy_from_slice(header);
    coinbase[32..].copy_from_slice(nonce);

    let h = blake2b256(&coinbase);
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&h[24..32]);
    let i = (u64::from_be_bytes(tail) % n as u64) as u32;

    let e = table_element(i, height);

    let mut seed = [0u8; 71];
    seed[..31].copy_from_slice(&e[1..]);
    seed[31..].copy_from_slice(&coinbase);
    let seed_hash = blake2b256(&seed);

    let mut doubled = [0u8; 64];
    doubled[..32].copy_from_slice(&seed_hash);
    doubled[32..].copy_from_slice(&seed_hash);

    // 32 overlapping windows of 4 bytes, one byte apart
    let mut f = [0u8; 32];
    for k in 0..K {
        let mut w = [0u8; 4];
        w.copy_from_slice(&doubled[k..k + 4]);
        let j = u32::from_be_bytes(w) % n;
        add_be32_in_place(&mut f, &table_element(j, height));
    }

    blake2b256(&f)
}

pub fn validate(
    header: &[u8; 32],
    nonce: &[u8; 8],
    height: u32,
    share_target: &BigUint,
    network_target: &BigUint,
) -> ValidationResult {
    let final_hash = BigUint::from_bytes_be(&hit(header, nonce, height));
    ValidationResult {
        valid: &final_hash < share_target,
        meets_network_target: &final_hash < network_target,
        final_hash,
    }
}
