use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use crate::models::{
    AccountStatus, AntigravityAccount, KiroAccount, KiroAuthMethod, KiroUsage, Provider,
    QwenAccount, SharedFlag, SharingPreference, User,
};

/// Durable account catalog. Mutations are single-row transactional; reads
/// are not repeatable and callers re-query after token updates.
#[derive(Clone)]
pub struct AccountStore {
    db_path: PathBuf,
}

fn map_antigravity(row: &Row<'_>) -> rusqlite::Result<AntigravityAccount> {
    Ok(AntigravityAccount {
        cookie_id: row.get("cookie_id")?,
        user_id: row.get("user_id")?,
        shared: SharedFlag::from_i64(row.get("is_shared")?),
        status: AccountStatus::from_i64(row.get("status")?),
        needs_reauth: row.get::<_, i64>("needs_reauth")? != 0,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        expires_at: row.get("expires_at")?,
        project_id: row.get("project_id")?,
        is_restricted: row.get::<_, i64>("is_restricted")? != 0,
        ineligible: row.get::<_, i64>("ineligible")? != 0,
        paid_tier: row.get::<_, i64>("paid_tier")? != 0,
        email: row.get("email")?,
    })
}

fn map_kiro(row: &Row<'_>) -> rusqlite::Result<KiroAccount> {
    Ok(KiroAccount {
        account_id: row.get("account_id")?,
        user_id: row.get("user_id")?,
        shared: SharedFlag::from_i64(row.get("is_shared")?),
        status: AccountStatus::from_i64(row.get("status")?),
        needs_reauth: row.get::<_, i64>("needs_reauth")? != 0,
        auth_method: KiroAuthMethod::parse(&row.get::<_, String>("auth_method")?),
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        expires_at: row.get("expires_at")?,
        client_id: row.get("client_id")?,
        client_secret: row.get("client_secret")?,
        profile_arn: row.get("profile_arn")?,
        machine_id: row.get("machine_id")?,
        region: row.get("region")?,
        usage: KiroUsage {
            subscription: row.get("subscription")?,
            current_usage: row.get("current_usage")?,
            usage_limit: row.get("usage_limit")?,
            reset_date: row.get("reset_date")?,
            free_trial_status: row.get("free_trial_status")?,
            free_trial_usage: row.get("free_trial_usage")?,
            free_trial_limit: row.get("free_trial_limit")?,
            free_trial_expiry: row.get("free_trial_expiry")?,
            bonus_usage: row.get("bonus_usage")?,
            bonus_limit: row.get("bonus_limit")?,
            bonus_available: row.get::<_, i64>("bonus_available")? != 0,
            bonus_details: row.get("bonus_details")?,
        },
    })
}

fn map_qwen(row: &Row<'_>) -> rusqlite::Result<QwenAccount> {
    Ok(QwenAccount {
        account_id: row.get("account_id")?,
        user_id: row.get("user_id")?,
        shared: SharedFlag::from_i64(row.get("is_shared")?),
        status: AccountStatus::from_i64(row.get("status")?),
        needs_reauth: row.get::<_, i64>("needs_reauth")? != 0,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        expires_at: row.get("expires_at")?,
        resource_url: row.get("resource_url")?,
    })
}

// Visibility rule shared by the selection queries: shared accounts are
// visible to everyone, dedicated ones only to their owner.
const AVAILABILITY_CLAUSE: &str = "(is_shared = 1 OR (is_shared = 0 AND user_id = ?1))";

fn retain_shared_flag<T>(mut pool: Vec<T>, shared: Option<SharedFlag>, flag_of: impl Fn(&T) -> SharedFlag) -> Vec<T> {
    if let Some(flag) = shared {
        pool.retain(|a| flag_of(a) == flag);
    }
    pool
}

impl AccountStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn conn(&self) -> Result<Connection, String> {
        super::db::connect(&self.db_path)
    }

    // ---- users ----

    pub fn insert_user(&self, user: &User) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, api_key, name, prefer_shared, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.api_key,
                user.name,
                user.prefer_shared.as_i64(),
                user.status.as_i64(),
                Utc::now().timestamp(),
            ],
        )
        .map_err(|e| format!("Failed to insert user: {}", e))?;
        Ok(())
    }

    pub fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, api_key, name, prefer_shared, status FROM users WHERE api_key = ?1",
            params![api_key],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    api_key: row.get(1)?,
                    name: row.get(2)?,
                    prefer_shared: SharingPreference::from_i64(row.get(3)?),
                    status: AccountStatus::from_i64(row.get(4)?),
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to query user: {}", e))
    }

    // ---- antigravity ----

    pub fn insert_antigravity(&self, account: &AntigravityAccount) -> Result<(), String> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO antigravity_accounts (
                cookie_id, user_id, is_shared, status, needs_reauth,
                access_token, refresh_token, expires_at, project_id,
                is_restricted, ineligible, paid_tier, email, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                account.cookie_id,
                account.user_id,
                account.shared.as_i64(),
                account.status.as_i64(),
                account.needs_reauth as i64,
                account.access_token,
                account.refresh_token,
                account.expires_at,
                account.project_id,
                account.is_restricted as i64,
                account.ineligible as i64,
                account.paid_tier as i64,
                account.email,
                now,
                now,
            ],
        )
        .map_err(|e| format!("Failed to insert antigravity account: {}", e))?;
        super::ledger::recompute_shared_pool(&conn, &account.user_id)?;
        Ok(())
    }

    /// Accounts eligible for selection: enabled, not awaiting re-auth,
    /// visible to `user_id` under the sharing rules.
    pub fn get_available_antigravity(
        &self,
        user_id: &str,
        shared: Option<SharedFlag>,
    ) -> Result<Vec<AntigravityAccount>, String> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT * FROM antigravity_accounts
             WHERE status = 1 AND needs_reauth = 0 AND {}",
            AVAILABILITY_CLAUSE
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map(params![user_id], map_antigravity)
            .map_err(|e| format!("Failed to query antigravity accounts: {}", e))?;
        let pool = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read antigravity account row: {}", e))?;
        Ok(retain_shared_flag(pool, shared, |a| a.shared))
    }

    pub fn get_antigravity(&self, cookie_id: &str) -> Result<Option<AntigravityAccount>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM antigravity_accounts WHERE cookie_id = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![cookie_id], map_antigravity)
            .optional()
            .map_err(|e| format!("Failed to query antigravity account: {}", e))
    }

    pub fn list_antigravity(&self) -> Result<Vec<AntigravityAccount>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM antigravity_accounts ORDER BY created_at")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map([], map_antigravity)
            .map_err(|e| format!("Failed to query antigravity accounts: {}", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read antigravity account row: {}", e))
    }

    /// Token + expiry are persisted in one statement; the rotated refresh
    /// token is included only when the provider returned one.
    pub fn update_antigravity_token(
        &self,
        cookie_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        match refresh_token {
            Some(rt) => conn.execute(
                "UPDATE antigravity_accounts
                 SET access_token = ?1, refresh_token = ?2, expires_at = ?3, updated_at = ?4
                 WHERE cookie_id = ?5",
                params![access_token, rt, expires_at, now, cookie_id],
            ),
            None => conn.execute(
                "UPDATE antigravity_accounts
                 SET access_token = ?1, expires_at = ?2, updated_at = ?3
                 WHERE cookie_id = ?4",
                params![access_token, expires_at, now, cookie_id],
            ),
        }
        .map_err(|e| format!("Failed to update antigravity token: {}", e))?;
        Ok(())
    }

    pub fn update_project_ids(
        &self,
        cookie_id: &str,
        project_id: &str,
        is_restricted: bool,
        ineligible: bool,
        paid_tier: bool,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE antigravity_accounts
             SET project_id = ?1, is_restricted = ?2, ineligible = ?3, paid_tier = ?4,
                 updated_at = ?5
             WHERE cookie_id = ?6",
            params![
                project_id,
                is_restricted as i64,
                ineligible as i64,
                paid_tier as i64,
                Utc::now().timestamp(),
                cookie_id,
            ],
        )
        .map_err(|e| format!("Failed to update project ids: {}", e))?;
        Ok(())
    }

    // ---- kiro ----

    pub fn insert_kiro(&self, account: &KiroAccount) -> Result<(), String> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO kiro_accounts (
                account_id, user_id, is_shared, status, needs_reauth, auth_method,
                access_token, refresh_token, expires_at, client_id, client_secret,
                profile_arn, machine_id, region, subscription, current_usage,
                usage_limit, reset_date, free_trial_status, free_trial_usage,
                free_trial_limit, free_trial_expiry, bonus_usage, bonus_limit,
                bonus_available, bonus_details, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                account.account_id,
                account.user_id,
                account.shared.as_i64(),
                account.status.as_i64(),
                account.needs_reauth as i64,
                account.auth_method.as_str(),
                account.access_token,
                account.refresh_token,
                account.expires_at,
                account.client_id,
                account.client_secret,
                account.profile_arn,
                account.machine_id,
                account.region,
                account.usage.subscription,
                account.usage.current_usage,
                account.usage.usage_limit,
                account.usage.reset_date,
                account.usage.free_trial_status,
                account.usage.free_trial_usage,
                account.usage.free_trial_limit,
                account.usage.free_trial_expiry,
                account.usage.bonus_usage,
                account.usage.bonus_limit,
                account.usage.bonus_available as i64,
                account.usage.bonus_details,
                now,
                now,
            ],
        )
        .map_err(|e| format!("Failed to insert kiro account: {}", e))?;
        super::ledger::recompute_shared_pool(&conn, &account.user_id)?;
        Ok(())
    }

    pub fn get_available_kiro(
        &self,
        user_id: &str,
        shared: Option<SharedFlag>,
    ) -> Result<Vec<KiroAccount>, String> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT * FROM kiro_accounts
             WHERE status = 1 AND needs_reauth = 0 AND {}",
            AVAILABILITY_CLAUSE
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map(params![user_id], map_kiro)
            .map_err(|e| format!("Failed to query kiro accounts: {}", e))?;
        let pool = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read kiro account row: {}", e))?;
        Ok(retain_shared_flag(pool, shared, |a| a.shared))
    }

    pub fn get_kiro(&self, account_id: &str) -> Result<Option<KiroAccount>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM kiro_accounts WHERE account_id = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![account_id], map_kiro)
            .optional()
            .map_err(|e| format!("Failed to query kiro account: {}", e))
    }

    pub fn update_kiro_token(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
        profile_arn: Option<&str>,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE kiro_accounts
             SET access_token = ?1,
                 refresh_token = COALESCE(?2, refresh_token),
                 expires_at = ?3,
                 profile_arn = COALESCE(?4, profile_arn),
                 updated_at = ?5
             WHERE account_id = ?6",
            params![access_token, refresh_token, expires_at, profile_arn, now, account_id],
        )
        .map_err(|e| format!("Failed to update kiro token: {}", e))?;
        Ok(())
    }

    pub fn update_kiro_usage(&self, account_id: &str, usage: &KiroUsage) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE kiro_accounts SET
                subscription = ?1, current_usage = ?2, usage_limit = ?3, reset_date = ?4,
                free_trial_status = ?5, free_trial_usage = ?6, free_trial_limit = ?7,
                free_trial_expiry = ?8, bonus_usage = ?9, bonus_limit = ?10,
                bonus_available = ?11, bonus_details = ?12, updated_at = ?13
             WHERE account_id = ?14",
            params![
                usage.subscription,
                usage.current_usage,
                usage.usage_limit,
                usage.reset_date,
                usage.free_trial_status,
                usage.free_trial_usage,
                usage.free_trial_limit,
                usage.free_trial_expiry,
                usage.bonus_usage,
                usage.bonus_limit,
                usage.bonus_available as i64,
                usage.bonus_details,
                Utc::now().timestamp(),
                account_id,
            ],
        )
        .map_err(|e| format!("Failed to update kiro usage: {}", e))?;
        Ok(())
    }

    // ---- qwen ----

    pub fn insert_qwen(&self, account: &QwenAccount) -> Result<(), String> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO qwen_accounts (
                account_id, user_id, is_shared, status, needs_reauth,
                access_token, refresh_token, expires_at, resource_url,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                account.account_id,
                account.user_id,
                account.shared.as_i64(),
                account.status.as_i64(),
                account.needs_reauth as i64,
                account.access_token,
                account.refresh_token,
                account.expires_at,
                account.resource_url,
                now,
                now,
            ],
        )
        .map_err(|e| format!("Failed to insert qwen account: {}", e))?;
        super::ledger::recompute_shared_pool(&conn, &account.user_id)?;
        Ok(())
    }

    pub fn get_available_qwen(
        &self,
        user_id: &str,
        shared: Option<SharedFlag>,
    ) -> Result<Vec<QwenAccount>, String> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT * FROM qwen_accounts
             WHERE status = 1 AND needs_reauth = 0 AND {}",
            AVAILABILITY_CLAUSE
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map(params![user_id], map_qwen)
            .map_err(|e| format!("Failed to query qwen accounts: {}", e))?;
        let pool = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read qwen account row: {}", e))?;
        Ok(retain_shared_flag(pool, shared, |a| a.shared))
    }

    pub fn get_qwen(&self, account_id: &str) -> Result<Option<QwenAccount>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM qwen_accounts WHERE account_id = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![account_id], map_qwen)
            .optional()
            .map_err(|e| format!("Failed to query qwen account: {}", e))
    }

    /// Qwen rotates the refresh token on every refresh and may move the
    /// account to a different tenant host.
    pub fn update_qwen_token(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
        resource_url: Option<&str>,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE qwen_accounts
             SET access_token = ?1,
                 refresh_token = COALESCE(?2, refresh_token),
                 expires_at = ?3,
                 resource_url = COALESCE(?4, resource_url),
                 updated_at = ?5
             WHERE account_id = ?6",
            params![
                access_token,
                refresh_token,
                expires_at,
                resource_url,
                Utc::now().timestamp(),
                account_id,
            ],
        )
        .map_err(|e| format!("Failed to update qwen token: {}", e))?;
        Ok(())
    }

    // ---- cross-provider mutations ----

    fn table_and_key(provider: Provider) -> (&'static str, &'static str) {
        match provider {
            Provider::Antigravity => ("antigravity_accounts", "cookie_id"),
            Provider::Kiro => ("kiro_accounts", "account_id"),
            Provider::Qwen => ("qwen_accounts", "account_id"),
        }
    }

    fn owner_of(conn: &Connection, provider: Provider, id: &str) -> Result<Option<String>, String> {
        let (table, key) = Self::table_and_key(provider);
        conn.query_row(
            &format!("SELECT user_id FROM {} WHERE {} = ?1", table, key),
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("Failed to query account owner: {}", e))
    }

    pub fn set_status(
        &self,
        provider: Provider,
        id: &str,
        status: AccountStatus,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        let (table, key) = Self::table_and_key(provider);
        let owner = Self::owner_of(&conn, provider, id)?;
        conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 WHERE {} = ?3",
                table, key
            ),
            params![status.as_i64(), Utc::now().timestamp(), id],
        )
        .map_err(|e| format!("Failed to update account status: {}", e))?;
        if let Some(user_id) = owner {
            super::ledger::recompute_shared_pool(&conn, &user_id)?;
        }
        Ok(())
    }

    pub fn mark_needs_reauth(&self, provider: Provider, id: &str) -> Result<(), String> {
        let conn = self.conn()?;
        let (table, key) = Self::table_and_key(provider);
        conn.execute(
            &format!(
                "UPDATE {} SET needs_reauth = 1, updated_at = ?1 WHERE {} = ?2",
                table, key
            ),
            params![Utc::now().timestamp(), id],
        )
        .map_err(|e| format!("Failed to mark needs_reauth: {}", e))?;
        Ok(())
    }

    pub fn set_shared_flag(
        &self,
        provider: Provider,
        id: &str,
        shared: SharedFlag,
    ) -> Result<(), String> {
        let conn = self.conn()?;
        let (table, key) = Self::table_and_key(provider);
        let owner = Self::owner_of(&conn, provider, id)?;
        conn.execute(
            &format!(
                "UPDATE {} SET is_shared = ?1, updated_at = ?2 WHERE {} = ?3",
                table, key
            ),
            params![shared.as_i64(), Utc::now().timestamp(), id],
        )
        .map_err(|e| format!("Failed to update shared flag: {}", e))?;
        if let Some(user_id) = owner {
            super::ledger::recompute_shared_pool(&conn, &user_id)?;
        }
        Ok(())
    }

    pub fn delete_account(&self, provider: Provider, id: &str) -> Result<(), String> {
        let conn = self.conn()?;
        let (table, key) = Self::table_and_key(provider);
        let owner = Self::owner_of(&conn, provider, id)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", table, key),
            params![id],
        )
        .map_err(|e| format!("Failed to delete account: {}", e))?;
        if let Some(user_id) = owner {
            super::ledger::recompute_shared_pool(&conn, &user_id)?;
        }
        Ok(())
    }
}
