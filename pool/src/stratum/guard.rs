//! Per-source connection and invalid-share limits.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_connections_per_ip: usize,
    /// Invalid shares tolerated per source within `invalid_window`.
    pub max_invalid_shares: u32,
    #[serde(with = "secs")]
    pub invalid_window: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 10,
            max_invalid_shares: 50,
            invalid_window: Duration::from_secs(3600),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy)]
struct InvalidCounter {
    count: u32,
    since: Instant,
}

/// Owned by the stratum server and reset when it stops.
#[derive(Debug, Default)]
pub struct SourceGuard {
    cfg: GuardConfig,
    connections: HashMap<IpAddr, usize>,
    invalid: HashMap<IpAddr, InvalidCounter>,
}

impl SourceGuard {
    pub fn new(cfg: GuardConfig) -> Self {
        Self { cfg, connections: HashMap::new(), invalid: HashMap::new() }
    }

    /// Reserves a connection slot. False when the source is at its cap.
    pub fn try_open(&mut self, ip: IpAddr) -> bool {
        let n = self.connections.entry(ip).or_insert(0);
        if *n >= self.cfg.max_connections_per_ip {
            return false;
        }
        *n += 1;
        true
    }

    pub fn close(&mut self, ip: IpAddr) {
        if let Some(n) = self.connections.get_mut(&ip) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.connections.remove(&ip);
            }
        }
    }

    pub fn connections(&self, ip: IpAddr) -> usize {
        self.connections.get(&ip).copied().unwrap_or(0)
    }

    /// Counts one invalid share. Returns true once the source is over its cap.
    pub fn record_invalid(&mut self, ip: IpAddr, now: Instant) -> bool {
        let window = self.cfg.invalid_window;
        let c = self
            .invalid
            .entry(ip)
            .or_insert(InvalidCounter { count: 0, since: now });
        if now.saturating_duration_since(c.since) > window {
            *c = InvalidCounter { count: 0, since: now };
        }
        c.count += 1;
        c.count > self.cfg.max_invalid_shares
    }

    pub fn is_banned(&self, ip: IpAddr, now: Instant) -> bool {
        self.invalid.get(&ip).is_some_and(|c| {
            c.count > self.cfg.max_invalid_shares
                && now.saturating_duration_since(c.since) <= self.cfg.invalid_window
        })
    }

    /// Drops expired invalid-share counters.
    pub fn purge(&mut self, now: Instant) -> usize {
        let window = self.cfg.invalid_window;
        let before = self.invalid.len();
        self.invalid
            .retain(|_, c| now.saturating_duration_since(c.since) <= window);
        before - self.invalid.len()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.invalid.clear();
    }
}
