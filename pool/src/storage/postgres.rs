//! PostgreSQL [`Store`] backend.
//!
//! Amounts are nanoERG in BIGINT columns with `CHECK (amount >= 0)`, so a
//! bug that would drive a balance negative aborts its transaction instead.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

use super::*;
use crate::error::{StoreError, StoreResult};

const WINDOW_PAGE: i64 = 2_000;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS miners (
        address TEXT PRIMARY KEY,
        last_worker TEXT NOT NULL DEFAULT 'default',
        total_paid BIGINT NOT NULL DEFAULT 0,
        first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS shares (
        id BIGSERIAL PRIMARY KEY,
        address TEXT NOT NULL,
        worker TEXT NOT NULL,
        work BIGINT NOT NULL,
        network_difficulty BIGINT NOT NULL,
        share_difficulty BIGINT NOT NULL,
        height BIGINT NOT NULL,
        valid BOOLEAN NOT NULL,
        mode TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_shares_pplns_window
    ON shares (id DESC) WHERE valid AND mode = 'pplns';

    CREATE INDEX IF NOT EXISTS idx_shares_created_at ON shares (created_at);

    CREATE INDEX IF NOT EXISTS idx_shares_address ON shares (address, created_at);

    CREATE TABLE IF NOT EXISTS blocks (
        height BIGINT PRIMARY KEY,
        block_id TEXT NOT NULL,
        reward BIGINT NOT NULL DEFAULT 0,
        network_difficulty BIGINT NOT NULL,
        finder_address TEXT NOT NULL,
        finder_worker TEXT NOT NULL,
        effort_percent DOUBLE PRECISION NOT NULL DEFAULT 0,
        mode TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        pplns_shares INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS block_rewards (
        height BIGINT NOT NULL REFERENCES blocks(height),
        address TEXT NOT NULL,
        amount BIGINT NOT NULL CHECK (amount >= 0),
        share_count INTEGER NOT NULL,
        PRIMARY KEY (height, address)
    );

    CREATE TABLE IF NOT EXISTS balances (
        address TEXT PRIMARY KEY,
        amount BIGINT NOT NULL DEFAULT 0 CHECK (amount >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS payments (
        id BIGSERIAL PRIMARY KEY,
        address TEXT NOT NULL,
        amount BIGINT NOT NULL CHECK (amount > 0),
        status TEXT NOT NULL,
        tx_id TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        sent_at TIMESTAMPTZ
    );

    CREATE INDEX IF NOT EXISTS idx_payments_status ON payments (status);
"#;

pub struct PostgresStore {
    client: Mutex<Client>,
    timeout: Duration,
}

fn to_i64(v: u64) -> StoreResult<i64> {
    i64::try_from(v).map_err(|_| StoreError::AmountOverflow(v))
}

fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

fn mode_of(s: &str) -> StoreResult<MiningMode> {
    MiningMode::parse(s).ok_or_else(|| StoreError::Integrity(format!("unknown mode '{s}'")))
}

fn block_from_row(row: &Row) -> StoreResult<BlockRecord> {
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    Ok(BlockRecord {
        height: to_u64(row.get("height")),
        block_id: row.get("block_id"),
        reward: to_u64(row.get("reward")),
        network_difficulty: to_u64(row.get("network_difficulty")),
        finder_address: row.get("finder_address"),
        finder_worker: row.get("finder_worker"),
        effort_percent: row.get("effort_percent"),
        mode: mode_of(&mode)?,
        status: BlockStatus::parse(&status)
            .ok_or_else(|| StoreError::Integrity(format!("unknown block status '{status}'")))?,
        pplns_shares: row.get::<_, i32>("pplns_shares").max(0) as u32,
        created_at: row.get("created_at"),
    })
}

fn payment_from_row(row: &Row) -> StoreResult<PaymentRecord> {
    let status: String = row.get("status");
    Ok(PaymentRecord {
        id: row.get("id"),
        address: row.get("address"),
        amount: to_u64(row.get("amount")),
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| StoreError::Integrity(format!("unknown payment status '{status}'")))?,
        tx_id: row.get("tx_id"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

const BLOCK_COLUMNS: &str = "height, block_id, reward, network_difficulty, finder_address, \
    finder_worker, effort_percent, mode, status, pplns_shares, created_at";

const PAYMENT_COLUMNS: &str = "id, address, amount, status, tx_id, error, created_at";

impl PostgresStore {
    pub async fn connect(db_url: &str, timeout: Duration) -> StoreResult<Self> {
        let connecting = tokio_postgres::connect(db_url, NoTls);
        let (client, connection) = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| StoreError::Timeout)??;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self { client: Mutex::new(client), timeout })
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        self.timed(async {
            self.client.lock().await.batch_execute(SCHEMA).await?;
            Ok(())
        })
        .await
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn set_pending_status(
        &self,
        ids: &[i64],
        status: PaymentStatus,
        error: &str,
        refund: bool,
    ) -> StoreResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                "UPDATE payments SET status = $2, error = $3 \
                 WHERE id = ANY($1) AND status = 'pending' RETURNING address, amount",
                &[&ids, &status.as_str(), &error],
            )
            .await?;
        if refund {
            for row in &rows {
                let address: String = row.get(0);
                let amount: i64 = row.get(1);
                tx.execute(
                    "INSERT INTO balances (address, amount) VALUES ($1, $2) \
                     ON CONFLICT (address) DO UPDATE \
                     SET amount = balances.amount + EXCLUDED.amount, updated_at = NOW()",
                    &[&address, &amount],
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> StoreResult<()> {
        self.timed(async {
            self.client.lock().await.query_one("SELECT 1", &[]).await?;
            Ok(())
        })
        .await
    }

    async fn record_share(&self, share: &NewShare) -> StoreResult<()> {
        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            tx.execute(
                "INSERT INTO shares (address, worker, work, network_difficulty, share_difficulty, \
                 height, valid, mode, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &share.address,
                    &share.worker,
                    &to_i64(share.work)?,
                    &to_i64(share.network_difficulty)?,
                    &to_i64(share.share_difficulty)?,
                    &to_i64(share.height)?,
                    &share.valid,
                    &share.mode.as_str(),
                    &share.created_at,
                ],
            )
            .await?;
            tx.execute(
                "INSERT INTO miners (address, last_worker) VALUES ($1, $2) \
                 ON CONFLICT (address) DO UPDATE SET last_worker = EXCLUDED.last_worker, last_seen = NOW()",
                &[&share.address, &share.worker],
            )
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn effort_since_last_block(&self, mode: MiningMode, finder: &str) -> StoreResult<f64> {
        self.timed(async {
            let client = self.client.lock().await;
            let row = match mode {
                MiningMode::Pplns => {
                    client
                        .query_one(
                            "SELECT COALESCE(SUM(work::float8 / (network_difficulty::float8 * $1)), 0) \
                             FROM shares WHERE valid AND mode = 'pplns' AND network_difficulty > 0 \
                             AND created_at > COALESCE((SELECT MAX(created_at) FROM blocks WHERE mode = 'pplns'), 'epoch')",
                            &[&(WORK_SCALE as f64)],
                        )
                        .await?
                }
                MiningMode::Solo => {
                    client
                        .query_one(
                            "SELECT COALESCE(SUM(work::float8 / (network_difficulty::float8 * $1)), 0) \
                             FROM shares WHERE valid AND mode = 'solo' AND address = $2 AND network_difficulty > 0 \
                             AND created_at > COALESCE((SELECT MAX(created_at) FROM blocks \
                                 WHERE mode = 'solo' AND finder_address = $2), 'epoch')",
                            &[&(WORK_SCALE as f64), &finder],
                        )
                        .await?
                }
            };
            let effort: f64 = row.get(0);
            Ok(effort * 100.0)
        })
        .await
    }

    async fn insert_block(&self, block: &NewBlock) -> StoreResult<bool> {
        self.timed(async {
            let n = self
                .client
                .lock()
                .await
                .execute(
                    "INSERT INTO blocks (height, block_id, network_difficulty, finder_address, \
                     finder_worker, effort_percent, mode) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (height) DO NOTHING",
                    &[
                        &to_i64(block.height)?,
                        &block.block_id,
                        &to_i64(block.network_difficulty)?,
                        &block.finder_address,
                        &block.finder_worker,
                        &block.effort_percent,
                        &block.mode.as_str(),
                    ],
                )
                .await?;
            Ok(n == 1)
        })
        .await
    }

    async fn block(&self, height: u64) -> StoreResult<Option<BlockRecord>> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt(
                    &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE height = $1"),
                    &[&to_i64(height)?],
                )
                .await?;
            row.as_ref().map(block_from_row).transpose()
        })
        .await
    }

    async fn pplns_window(&self, window_work: u128) -> StoreResult<Vec<WindowShare>> {
        self.timed(async {
            let client = self.client.lock().await;
            let mut out = Vec::new();
            let mut acc: u128 = 0;
            let mut before = i64::MAX;
            while acc < window_work {
                let rows = client
                    .query(
                        "SELECT id, address, work FROM shares \
                         WHERE valid AND mode = 'pplns' AND work > 0 AND id < $1 \
                         ORDER BY id DESC LIMIT $2",
                        &[&before, &WINDOW_PAGE],
                    )
                    .await?;
                if rows.is_empty() {
                    break;
                }
                for row in &rows {
                    before = row.get(0);
                    let work = to_u64(row.get(2));
                    acc += work as u128;
                    out.push(WindowShare { address: row.get(1), work });
                    if acc >= window_work {
                        break;
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn block_rewards(&self, height: u64) -> StoreResult<Vec<BlockReward>> {
        self.timed(async {
            let rows = self
                .client
                .lock()
                .await
                .query(
                    "SELECT address, amount, share_count FROM block_rewards \
                     WHERE height = $1 ORDER BY amount DESC, address",
                    &[&to_i64(height)?],
                )
                .await?;
            Ok(rows
                .iter()
                .map(|r| BlockReward {
                    address: r.get(0),
                    amount: to_u64(r.get(1)),
                    share_count: r.get::<_, i32>(2).max(0) as u32,
                })
                .collect())
        })
        .await
    }

    async fn apply_distribution(
        &self,
        height: u64,
        reward: u64,
        rewards: &[BlockReward],
        pplns_shares: u32,
    ) -> StoreResult<bool> {
        self.timed(async {
            let h = to_i64(height)?;
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            if tx
                .query_opt("SELECT height FROM blocks WHERE height = $1 FOR UPDATE", &[&h])
                .await?
                .is_none()
            {
                return Err(StoreError::NotFound(format!("block {height}")));
            }
            let existing: i64 = tx
                .query_one("SELECT COUNT(*) FROM block_rewards WHERE height = $1", &[&h])
                .await?
                .get(0);
            if existing > 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            for r in rewards {
                tx.execute(
                    "INSERT INTO block_rewards (height, address, amount, share_count) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                    &[&h, &r.address, &to_i64(r.amount)?, &(r.share_count.min(i32::MAX as u32) as i32)],
                )
                .await?;
            }
            tx.execute(
                "UPDATE blocks SET reward = $2, pplns_shares = $3 WHERE height = $1",
                &[&h, &to_i64(reward)?, &(pplns_shares.min(i32::MAX as u32) as i32)],
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn pending_blocks(&self) -> StoreResult<Vec<BlockRecord>> {
        self.timed(async {
            let rows = self
                .client
                .lock()
                .await
                .query(
                    &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE status = 'pending' ORDER BY height"),
                    &[],
                )
                .await?;
            rows.iter().map(block_from_row).collect()
        })
        .await
    }

    async fn mark_block_orphan(&self, height: u64) -> StoreResult<()> {
        self.timed(async {
            self.client
                .lock()
                .await
                .execute(
                    "UPDATE blocks SET status = 'orphan' WHERE height = $1 AND status = 'pending'",
                    &[&to_i64(height)?],
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn confirm_block_and_credit(&self, height: u64) -> StoreResult<bool> {
        self.timed(async {
            let h = to_i64(height)?;
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            let status: Option<String> = tx
                .query_opt("SELECT status FROM blocks WHERE height = $1 FOR UPDATE", &[&h])
                .await?
                .map(|r| r.get(0));
            if status.as_deref() != Some(BlockStatus::Pending.as_str()) {
                tx.rollback().await?;
                return Ok(false);
            }
            let rewards = tx
                .query("SELECT address, amount FROM block_rewards WHERE height = $1", &[&h])
                .await?;
            if rewards.is_empty() {
                tx.rollback().await?;
                return Ok(false);
            }
            for row in &rewards {
                let address: String = row.get(0);
                let amount: i64 = row.get(1);
                tx.execute(
                    "INSERT INTO balances (address, amount) VALUES ($1, $2) \
                     ON CONFLICT (address) DO UPDATE \
                     SET amount = balances.amount + EXCLUDED.amount, updated_at = NOW()",
                    &[&address, &amount],
                )
                .await?;
            }
            tx.execute("UPDATE blocks SET status = 'confirmed' WHERE height = $1", &[&h])
                .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn payable_balances(&self, min: u64, exclude: Option<&str>) -> StoreResult<Vec<Balance>> {
        self.timed(async {
            let exclude = exclude.unwrap_or("");
            let rows = self
                .client
                .lock()
                .await
                .query(
                    "SELECT address, amount FROM balances WHERE amount >= $1 AND address <> $2 \
                     ORDER BY amount DESC, address",
                    &[&to_i64(min)?, &exclude],
                )
                .await?;
            Ok(rows
                .iter()
                .map(|r| Balance { address: r.get(0), amount: to_u64(r.get(1)) })
                .collect())
        })
        .await
    }

    async fn prepare_payments(&self, entries: &[Balance]) -> StoreResult<Vec<PreparedPayment>> {
        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            let mut out = Vec::new();
            for e in entries.iter().filter(|e| e.amount > 0) {
                let amount = to_i64(e.amount)?;
                let debited = tx
                    .execute(
                        "UPDATE balances SET amount = amount - $1, updated_at = NOW() \
                         WHERE address = $2 AND amount >= $1",
                        &[&amount, &e.address],
                    )
                    .await?;
                if debited != 1 {
                    continue;
                }
                let id: i64 = tx
                    .query_one(
                        "INSERT INTO payments (address, amount, status) VALUES ($1, $2, 'pending') RETURNING id",
                        &[&e.address, &amount],
                    )
                    .await?
                    .get(0);
                out.push(PreparedPayment { id, address: e.address.clone(), amount: e.amount });
            }
            tx.commit().await?;
            Ok(out)
        })
        .await
    }

    async fn finalize_payments(&self, ids: &[i64], tx_id: &str) -> StoreResult<()> {
        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            let rows = tx
                .query(
                    "UPDATE payments SET status = 'sent', tx_id = $2, sent_at = NOW() \
                     WHERE id = ANY($1) AND status = 'pending' RETURNING address, amount",
                    &[&ids, &tx_id],
                )
                .await?;
            for row in &rows {
                let address: String = row.get(0);
                let amount: i64 = row.get(1);
                tx.execute(
                    "INSERT INTO miners (address, total_paid) VALUES ($1, $2) \
                     ON CONFLICT (address) DO UPDATE SET total_paid = miners.total_paid + EXCLUDED.total_paid",
                    &[&address, &amount],
                )
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn fail_payments(&self, ids: &[i64], error: &str) -> StoreResult<()> {
        self.timed(self.set_pending_status(ids, PaymentStatus::Failed, error, true))
            .await
    }

    async fn mark_payments_unknown(&self, ids: &[i64], error: &str) -> StoreResult<()> {
        self.timed(self.set_pending_status(ids, PaymentStatus::Unknown, error, false))
            .await
    }

    async fn payments_by_status(&self, status: PaymentStatus) -> StoreResult<Vec<PaymentRecord>> {
        self.timed(async {
            let rows = self
                .client
                .lock()
                .await
                .query(
                    &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = $1 ORDER BY id"),
                    &[&status.as_str()],
                )
                .await?;
            rows.iter().map(payment_from_row).collect()
        })
        .await
    }

    async fn resolve_unknown_payment(&self, id: i64, resolution: &Resolution) -> StoreResult<bool> {
        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;
            let Some(row) = tx
                .query_opt(
                    "SELECT address, amount FROM payments WHERE id = $1 AND status = 'unknown' FOR UPDATE",
                    &[&id],
                )
                .await?
            else {
                tx.rollback().await?;
                return Ok(false);
            };
            let address: String = row.get(0);
            let amount: i64 = row.get(1);
            match resolution {
                Resolution::Sent { tx_id } => {
                    tx.execute(
                        "UPDATE payments SET status = 'sent', tx_id = $2, sent_at = NOW() WHERE id = $1",
                        &[&id, tx_id],
                    )
                    .await?;
                    tx.execute(
                        "INSERT INTO miners (address, total_paid) VALUES ($1, $2) \
                         ON CONFLICT (address) DO UPDATE SET total_paid = miners.total_paid + EXCLUDED.total_paid",
                        &[&address, &amount],
                    )
                    .await?;
                }
                Resolution::NotSent => {
                    tx.execute("UPDATE payments SET status = 'failed' WHERE id = $1", &[&id])
                        .await?;
                    tx.execute(
                        "INSERT INTO balances (address, amount) VALUES ($1, $2) \
                         ON CONFLICT (address) DO UPDATE \
                         SET amount = balances.amount + EXCLUDED.amount, updated_at = NOW()",
                        &[&address, &amount],
                    )
                    .await?;
                }
            }
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn balance(&self, address: &str) -> StoreResult<u64> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt("SELECT amount FROM balances WHERE address = $1", &[&address])
                .await?;
            Ok(row.map(|r| to_u64(r.get(0))).unwrap_or(0))
        })
        .await
    }

    async fn payment(&self, id: i64) -> StoreResult<Option<PaymentRecord>> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"), &[&id])
                .await?;
            row.as_ref().map(payment_from_row).transpose()
        })
        .await
    }

    async fn prune_failed_payments(&self, keep: usize) -> StoreResult<u64> {
        self.timed(async {
            let keep = keep as i64;
            let n = self
                .client
                .lock()
                .await
                .execute(
                    "DELETE FROM payments WHERE id IN (\
                        SELECT id FROM (\
                            SELECT id, ROW_NUMBER() OVER (PARTITION BY address ORDER BY id DESC) AS rn \
                            FROM payments WHERE status = 'failed'\
                        ) ranked WHERE rn > $1)",
                    &[&keep],
                )
                .await?;
            Ok(n)
        })
        .await
    }

    async fn prune_shares(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.timed(async {
            let n = self
                .client
                .lock()
                .await
                .execute("DELETE FROM shares WHERE created_at < $1", &[&before])
                .await?;
            Ok(n)
        })
        .await
    }
}
