use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::payout::NANO_ERG;
use crate::stratum::GuardConfig;
use crate::vardiff::VarDiffConfig;

const DEFAULT_CONFIG_FILE: &str = "pool_config.json";

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub stratum_host: String,
    pub pplns_port: u16,
    pub solo_port: u16,
    pub metrics_listen: String,

    pub node_url: String,
    pub node_api_key: String,
    pub node_timeout_secs: u64,
    pub node_poll_ms: u64,
    pub payment_timeout_secs: u64,

    pub store_backend: StoreBackend,
    pub database_url: String,
    /// Bounds the connect and every query on the postgres store.
    pub db_timeout_secs: u64,

    /// Fractions, e.g. 0.01 for 1 %
    pub pool_fee: Decimal,
    pub solo_fee: Decimal,
    pub pool_address: Option<String>,
    pub pplns_factor: u64,

    pub min_payout: u64,
    pub confirmations: u64,
    pub payout_max_per_batch: usize,
    pub payout_interval_minutes: u64,
    pub wallet_pass: Option<String>,
    pub share_retention_days: u64,

    pub webhook_url: Option<String>,

    pub job_history: usize,
    pub extranonce2_size: usize,
    pub guard: GuardConfig,
    pub vardiff: VarDiffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stratum_host: "0.0.0.0".to_string(),
            pplns_port: 3416,
            solo_port: 3417,
            metrics_listen: "0.0.0.0:9100".to_string(),
            node_url: "http://127.0.0.1:9053".to_string(),
            node_api_key: String::new(),
            node_timeout_secs: 10,
            node_poll_ms: 2000,
            payment_timeout_secs: 30,
            store_backend: StoreBackend::Postgres,
            database_url: String::new(),
            db_timeout_secs: 5,
            pool_fee: dec!(0.01),
            solo_fee: dec!(0.015),
            pool_address: None,
            pplns_factor: 2,
            min_payout: NANO_ERG,
            confirmations: 720,
            payout_max_per_batch: 20,
            payout_interval_minutes: 10,
            wallet_pass: None,
            share_retention_days: 7,
            webhook_url: None,
            job_history: 10,
            extranonce2_size: 6,
            guard: GuardConfig::default(),
            vardiff: VarDiffConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then `pool_config.json` (or the file named by
    /// `POOL_CONFIG`), then environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("POOL_CONFIG").ok();
        let file = path.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);

        let mut cfg = match std::fs::read_to_string(file) {
            Ok(txt) => Self::from_json(&txt).with_context(|| format!("failed to parse {file}"))?,
            // an explicitly named file must exist
            Err(e) if path.is_some() => return Err(e).with_context(|| format!("failed to read {file}")),
            Err(_) => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self> {
        Ok(serde_json::from_str(txt)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(h) = std::env::var("STRATUM_HOST") { self.stratum_host = h; }
        if let Some(p) = env_parse("STRATUM_PORT") { self.pplns_port = p; }
        if let Some(p) = env_parse("STRATUM_SOLO_PORT") { self.solo_port = p; }
        if let Ok(m) = std::env::var("METRICS_LISTEN") { self.metrics_listen = m; }

        if let Ok(u) = std::env::var("ERGO_NODE_URL") { self.node_url = u; }
        if let Ok(k) = std::env::var("ERGO_NODE_API_KEY") { self.node_api_key = k; }
        if let Some(n) = env_parse("NODE_TIMEOUT_SECS") { self.node_timeout_secs = n; }
        if let Some(n) = env_parse("NODE_POLL_MS") { self.node_poll_ms = n; }

        match std::env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => self.store_backend = StoreBackend::Memory,
            Ok("postgres") => self.store_backend = StoreBackend::Postgres,
            _ => {}
        }
        if let Ok(u) = std::env::var("DATABASE_URL") {
            self.database_url = u;
        } else if let Some(u) = database_url_from_parts() {
            self.database_url = u;
        }
        if let Some(n) = env_parse("DB_TIMEOUT_SECS") { self.db_timeout_secs = n; }

        if let Some(f) = env_parse("POOL_FEE") { self.pool_fee = f; }
        if let Some(f) = env_parse("SOLO_FEE") { self.solo_fee = f; }
        if let Ok(a) = std::env::var("POOL_ADDRESS") { self.pool_address = non_empty(a); }
        if let Some(n) = env_parse("PPLNS_FACTOR") { self.pplns_factor = n; }

        if let Some(n) = env_parse("MIN_PAYOUT_NANO") { self.min_payout = n; }
        if let Some(n) = env_parse("PAYOUT_CONFIRMATIONS") { self.confirmations = n; }
        if let Some(n) = env_parse("PAYOUT_MAX_PER_BATCH") { self.payout_max_per_batch = n; }
        if let Some(n) = env_parse("PAYOUT_INTERVAL_MINUTES") { self.payout_interval_minutes = n; }
        if let Ok(p) = std::env::var("WALLET_PASS") { self.wallet_pass = non_empty(p); }

        if let Ok(u) = std::env::var("DISCORD_WEBHOOK_URL") { self.webhook_url = non_empty(u); }

        self.vardiff = self.vardiff.apply_env();
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_backend == StoreBackend::Postgres && self.database_url.trim().is_empty() {
            bail!("the postgres store needs DATABASE_URL (or DB_HOST/DB_USER/DB_PASS/DB_NAME)");
        }
        if self.pplns_port == self.solo_port {
            bail!("PPLNS and SOLO ports must differ (both {})", self.pplns_port);
        }
        fee_bps(self.pool_fee).context("invalid pool fee")?;
        fee_bps(self.solo_fee).context("invalid solo fee")?;
        if self.pplns_factor == 0 {
            bail!("PPLNS factor must be at least 1");
        }
        if self.payout_max_per_batch == 0 {
            bail!("payout batch size must be at least 1");
        }
        if self.extranonce2_size == 0 || self.extranonce2_size > 6 {
            // extranonce1 is 2 bytes and the full nonce is 8
            bail!("extranonce2 size must be 1..=6 bytes");
        }
        if self.vardiff.min_difficulty > self.vardiff.max_difficulty {
            bail!("vardiff min difficulty exceeds max");
        }
        Ok(())
    }

    pub fn pool_fee_bps(&self) -> u32 {
        fee_bps(self.pool_fee).unwrap_or(0)
    }

    pub fn solo_fee_bps(&self) -> u32 {
        fee_bps(self.solo_fee).unwrap_or(0)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs.max(1))
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.node_poll_ms.max(100))
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs.max(1))
    }

    pub fn payout_interval(&self) -> Duration {
        Duration::from_secs(self.payout_interval_minutes.max(1) * 60)
    }

    pub fn share_retention(&self) -> Duration {
        Duration::from_secs(self.share_retention_days.max(1) * 24 * 3600)
    }
}

/// Decimal fraction to basis points; must lie in [0, 1).
pub fn fee_bps(fee: Decimal) -> Result<u32> {
    if fee < Decimal::ZERO || fee >= Decimal::ONE {
        bail!("fee {fee} outside [0, 1)");
    }
    (fee * dec!(10000))
        .round()
        .to_u32()
        .with_context(|| format!("fee {fee} not representable"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim().to_string();
    (!s.is_empty()).then_some(s)
}

fn database_url_from_parts() -> Option<String> {
    let pass = std::env::var("DB_PASS").ok().filter(|p| !p.is_empty())?;
    let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("DB_USER").unwrap_or_else(|_| "ergo_pool".to_string());
    let name = std::env::var("DB_NAME").unwrap_or_else(|_| "ergo_pool".to_string());
    Some(format!("host={host} port={port} user={user} password={pass} dbname={name}"))
}
