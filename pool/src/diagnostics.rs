//! Recent-share feed for operators.
//!
//! Each accepted share is kept with the ratio of its hash to the network
//! target; a ratio below 1.0 is a block.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::Serialize;

use crate::session::MiningMode;

pub const DEFAULT_FEED_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareRoll {
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub worker: String,
    pub mode: MiningMode,
    pub height: u32,
    pub difficulty: u64,
    /// hash / network target
    pub ratio: f64,
    pub is_block: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    /// Newest first
    pub recent: Vec<ShareRoll>,
    pub best_ratio: Option<f64>,
    pub total: u64,
    pub block_candidates: u64,
}

#[derive(Debug)]
pub struct ShareFeed {
    capacity: usize,
    rolls: VecDeque<ShareRoll>,
    best_ratio: Option<f64>,
    total: u64,
    block_candidates: u64,
}

impl Default for ShareFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// `hash / target` as a float; infinite when the target is zero.
pub fn hash_ratio(hash: &BigUint, target: &BigUint) -> f64 {
    let t = target.to_f64().unwrap_or(f64::INFINITY);
    if t == 0.0 {
        return f64::INFINITY;
    }
    hash.to_f64().unwrap_or(f64::INFINITY) / t
}

impl ShareFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rolls: VecDeque::with_capacity(capacity.max(1)),
            best_ratio: None,
            total: 0,
            block_candidates: 0,
        }
    }

    pub fn record(&mut self, roll: ShareRoll) {
        self.total += 1;
        if roll.is_block {
            self.block_candidates += 1;
        }
        if self.best_ratio.map_or(true, |b| roll.ratio < b) {
            self.best_ratio = Some(roll.ratio);
        }
        if self.rolls.len() == self.capacity {
            self.rolls.pop_front();
        }
        self.rolls.push_back(roll);
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            recent: self.rolls.iter().rev().cloned().collect(),
            best_ratio: self.best_ratio,
            total: self.total,
            block_candidates: self.block_candidates,
        }
    }

    pub fn clear(&mut self) {
        self.rolls.clear();
        self.best_ratio = None;
        self.total = 0;
        self.block_candidates = 0;
    }
}
