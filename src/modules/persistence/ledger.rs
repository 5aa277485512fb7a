use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;

use crate::constants::{quota_group_for_model, POOL_QUOTA_PER_ACCOUNT};

#[derive(Debug, Clone)]
pub struct ModelQuotaRow {
    pub cookie_id: String,
    pub model_name: String,
    pub remaining: f64,
    pub reset_time: Option<String>,
    pub available: bool,
    pub last_fetched_at: i64,
}

#[derive(Debug, Clone)]
pub struct ConsumptionRow {
    pub id: i64,
    pub user_id: String,
    pub account_id: String,
    pub model_name: String,
    pub quota_before: f64,
    pub quota_after: f64,
    pub consumed: f64,
    pub is_shared: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SharedPoolRow {
    pub user_id: String,
    pub model_group: String,
    pub quota: f64,
    pub max_quota: f64,
    pub last_recovered_at: Option<i64>,
}

/// Storage half of the Quota Ledger: per-(account, model) cached fractions,
/// the append-only consumption log and the per-user shared pools.
#[derive(Clone)]
pub struct QuotaLedgerDb {
    db_path: PathBuf,
}

fn shared_enabled_count(conn: &Connection, user_id: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM antigravity_accounts
              WHERE user_id = ?1 AND is_shared = 1 AND status = 1)
          + (SELECT COUNT(*) FROM kiro_accounts
              WHERE user_id = ?1 AND is_shared = 1 AND status = 1)
          + (SELECT COUNT(*) FROM qwen_accounts
              WHERE user_id = ?1 AND is_shared = 1 AND status = 1)",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to count shared accounts: {}", e))
}

/// Recomputes `max_quota = 2.0 x shared-enabled-count` for every pool row of
/// the user. Runs inside account mutations so the invariant holds after any
/// add / enable / disable / delete commits. Balances above the new ceiling
/// are clamped down to it.
pub fn recompute_shared_pool(conn: &Connection, user_id: &str) -> Result<(), String> {
    let count = shared_enabled_count(conn, user_id)?;
    let max_quota = POOL_QUOTA_PER_ACCOUNT * count as f64;
    conn.execute(
        "UPDATE user_shared_pool
         SET max_quota = ?1, quota = MIN(quota, ?1)
         WHERE user_id = ?2",
        params![max_quota, user_id],
    )
    .map_err(|e| format!("Failed to recompute shared pool: {}", e))?;
    Ok(())
}

fn ensure_pool_row(conn: &Connection, user_id: &str, group: &str) -> Result<(), String> {
    let count = shared_enabled_count(conn, user_id)?;
    let max_quota = POOL_QUOTA_PER_ACCOUNT * count as f64;
    conn.execute(
        "INSERT INTO user_shared_pool (user_id, model_group, quota, max_quota, last_recovered_at)
         VALUES (?1, ?2, ?3, ?3, ?4)
         ON CONFLICT (user_id, model_group) DO NOTHING",
        params![user_id, group, max_quota, Utc::now().timestamp()],
    )
    .map_err(|e| format!("Failed to ensure pool row: {}", e))?;
    Ok(())
}

impl QuotaLedgerDb {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn conn(&self) -> Result<Connection, String> {
        super::db::connect(&self.db_path)
    }

    pub fn get_quota(
        &self,
        cookie_id: &str,
        model_name: &str,
    ) -> Result<Option<ModelQuotaRow>, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cookie_id, model_name, remaining, reset_time, available, last_fetched_at
             FROM model_quotas WHERE cookie_id = ?1 AND model_name = ?2",
            params![cookie_id, model_name],
            |row| {
                Ok(ModelQuotaRow {
                    cookie_id: row.get(0)?,
                    model_name: row.get(1)?,
                    remaining: row.get(2)?,
                    reset_time: row.get(3)?,
                    available: row.get::<_, i64>(4)? != 0,
                    last_fetched_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to query model quota: {}", e))
    }

    /// One upstream models-list response covers every model of an account;
    /// the whole batch lands in one transaction.
    pub fn upsert_quotas(
        &self,
        cookie_id: &str,
        quotas: &[(String, f64, Option<String>, bool)],
    ) -> Result<(), String> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to start transaction: {}", e))?;
        let now = Utc::now().timestamp();
        for (model, remaining, reset_time, available) in quotas {
            tx.execute(
                "INSERT INTO model_quotas
                    (cookie_id, model_name, remaining, reset_time, available, last_fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (cookie_id, model_name) DO UPDATE SET
                    remaining = excluded.remaining,
                    reset_time = excluded.reset_time,
                    available = excluded.available,
                    last_fetched_at = excluded.last_fetched_at",
                params![cookie_id, model, remaining, reset_time, *available as i64, now],
            )
            .map_err(|e| format!("Failed to upsert model quota: {}", e))?;
        }
        tx.commit()
            .map_err(|e| format!("Failed to commit quota upsert: {}", e))?;
        Ok(())
    }

    /// Appends one immutable consumption row and, for shared accounts,
    /// decrements the caller's pool for the model's quota group. Both writes
    /// commit in one transaction so a crash cannot leave them drifted.
    /// Returns the consumed fraction.
    pub fn record_consumption(
        &self,
        user_id: &str,
        account_id: &str,
        model_name: &str,
        quota_before: f64,
        quota_after: f64,
        is_shared: bool,
    ) -> Result<f64, String> {
        let consumed = (quota_before - quota_after).max(0.0);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| format!("Failed to start transaction: {}", e))?;
        tx.execute(
            "INSERT INTO consumption_log
                (user_id, account_id, model_name, quota_before, quota_after,
                 consumed, is_shared, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                account_id,
                model_name,
                quota_before,
                quota_after,
                consumed,
                is_shared as i64,
                Utc::now().timestamp(),
            ],
        )
        .map_err(|e| format!("Failed to append consumption row: {}", e))?;

        if is_shared {
            let group = quota_group_for_model(model_name);
            ensure_pool_row(&tx, user_id, group)?;
            tx.execute(
                "UPDATE user_shared_pool
                 SET quota = MAX(0, quota - ?1)
                 WHERE user_id = ?2 AND model_group = ?3",
                params![consumed, user_id, group],
            )
            .map_err(|e| format!("Failed to decrement shared pool: {}", e))?;
        }

        tx.commit()
            .map_err(|e| format!("Failed to commit consumption: {}", e))?;
        Ok(consumed)
    }

    /// Current pool balance for the model's group, creating the row at full
    /// capacity on first use.
    pub fn pool_balance(&self, user_id: &str, model_name: &str) -> Result<f64, String> {
        let conn = self.conn()?;
        let group = quota_group_for_model(model_name);
        ensure_pool_row(&conn, user_id, group)?;
        conn.query_row(
            "SELECT quota FROM user_shared_pool WHERE user_id = ?1 AND model_group = ?2",
            params![user_id, group],
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to query pool balance: {}", e))
    }

    pub fn get_pool_row(
        &self,
        user_id: &str,
        model_group: &str,
    ) -> Result<Option<SharedPoolRow>, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT user_id, model_group, quota, max_quota, last_recovered_at
             FROM user_shared_pool WHERE user_id = ?1 AND model_group = ?2",
            params![user_id, model_group],
            |row| {
                Ok(SharedPoolRow {
                    user_id: row.get(0)?,
                    model_group: row.get(1)?,
                    quota: row.get(2)?,
                    max_quota: row.get(3)?,
                    last_recovered_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to query pool row: {}", e))
    }

    /// Operator action: refill a user's pools back to their ceilings.
    pub fn recover_pools(&self, user_id: &str) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE user_shared_pool
             SET quota = max_quota, last_recovered_at = ?1
             WHERE user_id = ?2",
            params![Utc::now().timestamp(), user_id],
        )
        .map_err(|e| format!("Failed to recover pools: {}", e))?;
        Ok(())
    }

    pub fn recent_consumption(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ConsumptionRow>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, account_id, model_name, quota_before, quota_after,
                        consumed, is_shared, created_at
                 FROM consumption_log WHERE user_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                Ok(ConsumptionRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    account_id: row.get(2)?,
                    model_name: row.get(3)?,
                    quota_before: row.get(4)?,
                    quota_after: row.get(5)?,
                    consumed: row.get(6)?,
                    is_shared: row.get::<_, i64>(7)? != 0,
                    created_at: row.get(8)?,
                })
            })
            .map_err(|e| format!("Failed to query consumption log: {}", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read consumption row: {}", e))
    }
}
