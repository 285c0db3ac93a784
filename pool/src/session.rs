//! Session registry
//!
//! Tracks every live stratum connection by its subscription id so the job
//! distributor can broadcast work and report per-mode counts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::stratum::connection::MinerSession;

/// Which payout scheme a listener (and every share it accepts) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningMode {
    Pplns,
    Solo,
}

impl MiningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiningMode::Pplns => "pplns",
            MiningMode::Solo => "solo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pplns" => Some(MiningMode::Pplns),
            "solo" => Some(MiningMode::Solo),
            _ => None,
        }
    }
}

impl std::fmt::Display for MiningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SharedSession = Arc<RwLock<MinerSession>>;

/// Public view of an authorized miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinerSummary {
    pub address: String,
    pub worker: String,
    pub mode: MiningMode,
    pub difficulty: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub connected: usize,
    pub authorized: usize,
}

#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SharedSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: SharedSession) {
        let id = session.read().await.id.clone();
        self.sessions.write().await.insert(id, session);
    }

    pub async fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions.write().await.remove(id)
    }

    /// Snapshot of all sessions; the registry lock is released before the
    /// caller touches any session.
    pub async fn all(&self) -> Vec<SharedSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn counts(&self, mode: Option<MiningMode>) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for session in self.all().await {
            let s = session.read().await;
            if mode.map_or(true, |m| s.mode == m) {
                counts.connected += 1;
                if s.is_authorized() {
                    counts.authorized += 1;
                }
            }
        }
        counts
    }

    pub async fn authorized_miners(&self, mode: Option<MiningMode>) -> Vec<MinerSummary> {
        let mut out = Vec::new();
        for session in self.all().await {
            let s = session.read().await;
            if !mode.map_or(true, |m| s.mode == m) {
                continue;
            }
            if let Some(address) = &s.address {
                out.push(MinerSummary {
                    address: address.clone(),
                    worker: s.worker.clone(),
                    mode: s.mode,
                    difficulty: s.difficulty,
                });
            }
        }
        out.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.worker.cmp(&b.worker)));
        out
    }

    /// Drops every entry and returns what was registered.
    pub async fn drain(&self) -> Vec<SharedSession> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}
