//! Mining jobs and the bounded recent-job history.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use num_bigint::BigUint;

use crate::blockchain::MiningCandidate;

pub const DEFAULT_JOB_HISTORY: usize = 10;

#[derive(Debug)]
pub struct Job {
    /// Lowercase hex of the job counter
    pub id: String,
    pub candidate: MiningCandidate,
    /// Submitted full nonces (extranonce1 ‖ extranonce2)
    nonces: Mutex<HashSet<String>>,
}

impl Job {
    pub fn new(seq: u64, candidate: MiningCandidate) -> Self {
        Self {
            id: format!("{:x}", seq),
            candidate,
            nonces: Mutex::new(HashSet::new()),
        }
    }

    pub fn height(&self) -> u32 {
        self.candidate.height
    }

    pub fn network_target(&self) -> &BigUint {
        &self.candidate.network_target
    }

    /// Share target for a session at `difficulty`: network target × difficulty.
    pub fn share_target(&self, difficulty: u64) -> BigUint {
        &self.candidate.network_target * BigUint::from(difficulty.max(1))
    }

    /// Atomically records `nonce`. Returns false if it was already submitted.
    pub fn claim_nonce(&self, nonce: &str) -> bool {
        match self.nonces.lock() {
            Ok(mut set) => set.insert(nonce.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(nonce.to_string()),
        }
    }

    pub fn submitted(&self) -> usize {
        match self.nonces.lock() {
            Ok(set) => set.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Current job plus a bounded window of recent ones. Older jobs are dropped
/// and shares against them are rejected as unknown.
#[derive(Debug)]
pub struct JobBook {
    capacity: usize,
    next_seq: u64,
    jobs: VecDeque<Arc<Job>>,
}

/// Result of offering a new candidate to the book.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job: Arc<Job>,
    pub height_changed: bool,
}

impl JobBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 1,
            jobs: VecDeque::new(),
        }
    }

    pub fn current(&self) -> Option<Arc<Job>> {
        self.jobs.back().cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.iter().rev().find(|j| j.id == id).cloned()
    }

    /// Creates a job if `candidate` differs from the current one (by header
    /// digest). Returns `None` when nothing changed.
    pub fn offer(&mut self, candidate: MiningCandidate) -> Option<NewJob> {
        let height_changed = match self.jobs.back() {
            Some(cur) if cur.candidate.msg == candidate.msg => return None,
            Some(cur) => cur.candidate.height != candidate.height,
            None => true,
        };

        let job = Arc::new(Job::new(self.next_seq, candidate));
        self.next_seq += 1;
        self.jobs.push_back(job.clone());
        while self.jobs.len() > self.capacity {
            self.jobs.pop_front();
        }
        Some(NewJob { job, height_changed })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}
