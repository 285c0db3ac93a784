use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Deserialize;

/// Difficulty here is a target multiplier: share target = network target ×
/// difficulty, so a higher value makes shares easier and more frequent.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VarDiffConfig {
    /// Desired average time between accepted shares.
    #[serde(with = "secs")]
    pub target_share_time: Duration,
    /// How often to retarget.
    #[serde(with = "secs")]
    pub retarget_time: Duration,
    /// Ignore small fluctuations; only retarget if deviation exceeds this fraction.
    pub variance: f64,
    /// Largest multiplicative change applied in one retarget.
    pub max_step: f64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    pub initial_difficulty: u64,
    /// Share timestamps kept per session.
    pub window: usize,
    /// Timestamps required before a retarget is considered.
    pub min_samples: usize,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_share_time: Duration::from_secs(15),
            retarget_time: Duration::from_secs(90),
            variance: 0.30,
            max_step: 1.25,
            min_difficulty: 100,
            max_difficulty: 500_000,
            initial_difficulty: 20_000,
            window: 20,
            min_samples: 8,
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

impl VarDiffConfig {
    /// Optional env overrides:
    /// - VARDIFF_TARGET_SHARE_SECS
    /// - VARDIFF_RETARGET_SECS
    /// - VARDIFF_VARIANCE
    /// - VARDIFF_MIN_DIFFICULTY
    /// - VARDIFF_MAX_DIFFICULTY
    /// - VARDIFF_INITIAL_DIFFICULTY
    pub fn apply_env(mut self) -> Self {
        if let Some(n) = env_parse::<u64>("VARDIFF_TARGET_SHARE_SECS") {
            self.target_share_time = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_parse::<u64>("VARDIFF_RETARGET_SECS") {
            self.retarget_time = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_parse::<f64>("VARDIFF_VARIANCE") {
            if n.is_finite() && n >= 0.0 {
                self.variance = n;
            }
        }
        if let Some(n) = env_parse::<u64>("VARDIFF_MIN_DIFFICULTY") {
            self.min_difficulty = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("VARDIFF_MAX_DIFFICULTY") {
            self.max_difficulty = n.max(self.min_difficulty);
        }
        if let Some(n) = env_parse::<u64>("VARDIFF_INITIAL_DIFFICULTY") {
            self.initial_difficulty = n;
        }
        self.initial_difficulty = self
            .initial_difficulty
            .clamp(self.min_difficulty, self.max_difficulty);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Per-session controller: a bounded ring of share timestamps, evaluated
/// on the retarget timer.
#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    samples: VecDeque<Instant>,
}

impl VarDiffState {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(cfg.window),
            cfg,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record an accepted share.
    pub fn on_share(&mut self, now: Instant) {
        if self.samples.len() == self.cfg.window {
            self.samples.pop_front();
        }
        self.samples.push_back(now);
    }

    /// Evaluate the window. Returns `Some(new_difficulty)` only when the
    /// difficulty actually changes; the window then restarts at `now`.
    pub fn retarget(&mut self, now: Instant, current_difficulty: u64) -> Option<u64> {
        if self.samples.len() < self.cfg.min_samples.max(2) {
            return None;
        }
        let (first, last) = (*self.samples.front()?, *self.samples.back()?);
        let span = last.saturating_duration_since(first).as_secs_f64();
        let avg = span / (self.samples.len() - 1) as f64;
        let target = self.cfg.target_share_time.as_secs_f64().max(0.000_001);

        let deviation = (avg - target).abs() / target;
        if deviation <= self.cfg.variance {
            return None;
        }

        let step = self.cfg.max_step.max(1.0);
        let ratio = (avg / target).clamp(1.0 / step, step);

        let cur = current_difficulty.max(1) as f64;
        let mut next = (cur * ratio).round();
        if !next.is_finite() || next <= 0.0 {
            next = 1.0;
        }
        let next = (next as u64).clamp(self.cfg.min_difficulty, self.cfg.max_difficulty);

        if next == current_difficulty {
            return None;
        }
        self.samples.clear();
        self.samples.push_back(now);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(st: &mut VarDiffState, start: Instant, interval: Duration, n: u32) -> Instant {
        let mut t = start;
        for _ in 0..n {
            t += interval;
            st.on_share(t);
        }
        t
    }

    #[test]
    fn needs_minimum_samples() {
        let mut st = VarDiffState::new(VarDiffConfig::default());
        let now = feed(&mut st, Instant::now(), Duration::from_secs(60), 7);
        assert_eq!(st.retarget(now, 20_000), None);
    }

    #[test]
    fn slow_shares_raise_multiplier_by_at_most_max_step() {
        let mut st = VarDiffState::new(VarDiffConfig::default());
        let now = feed(&mut st, Instant::now(), Duration::from_secs(120), 10);
        assert_eq!(st.retarget(now, 20_000), Some(25_000));
        assert_eq!(st.sample_count(), 1);
    }

    #[test]
    fn fast_shares_lower_multiplier_by_at_most_max_step() {
        let mut st = VarDiffState::new(VarDiffConfig::default());
        let now = feed(&mut st, Instant::now(), Duration::from_secs(1), 20);
        assert_eq!(st.retarget(now, 20_000), Some(16_000));
    }

    #[test]
    fn within_tolerance_band_keeps_difficulty() {
        let mut st = VarDiffState::new(VarDiffConfig::default());
        let now = feed(&mut st, Instant::now(), Duration::from_secs(18), 12);
        assert_eq!(st.retarget(now, 20_000), None);
        assert_eq!(st.sample_count(), 12);
    }

    #[test]
    fn clamps_to_bounds() {
        let cfg = VarDiffConfig::default();
        let mut st = VarDiffState::new(cfg);
        let now = feed(&mut st, Instant::now(), Duration::from_secs(300), 10);
        assert_eq!(st.retarget(now, cfg.max_difficulty), None);

        let mut st = VarDiffState::new(cfg);
        let now = feed(&mut st, Instant::now(), Duration::from_millis(100), 10);
        assert_eq!(st.retarget(now, 110), Some(cfg.min_difficulty));
    }

    #[test]
    fn ring_is_bounded() {
        let mut st = VarDiffState::new(VarDiffConfig::default());
        feed(&mut st, Instant::now(), Duration::from_secs(1), 50);
        assert_eq!(st.sample_count(), 20);
    }

    /// Simulated miner whose share rate is proportional to the multiplier:
    /// at `d` it finds a share every `k / d` seconds.
    #[test]
    fn converges_toward_target_cadence() {
        let cfg = VarDiffConfig::default();
        for (start_diff, k) in [(20_000u64, 1_200_000.0f64), (20_000, 30_000.0)] {
            let mut st = VarDiffState::new(cfg);
            let mut diff = start_diff;
            let mut now = Instant::now();
            for _ in 0..40 {
                let interval = Duration::from_secs_f64(k / diff as f64);
                now = feed(&mut st, now, interval, 20);
                if let Some(next) = st.retarget(now, diff) {
                    let ratio = next as f64 / diff as f64;
                    assert!(ratio <= cfg.max_step + 1e-3 && ratio >= 1.0 / cfg.max_step - 1e-3);
                    diff = next;
                }
            }
            let cadence = k / diff as f64;
            let target = cfg.target_share_time.as_secs_f64();
            assert!(
                (cadence - target).abs() / target <= cfg.variance + 0.01,
                "cadence {cadence} did not converge (diff {diff})"
            );
        }
    }
}
