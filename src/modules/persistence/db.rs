use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub fn connect(path: &Path) -> Result<Connection, String> {
    let conn =
        Connection::open(path).map_err(|e| format!("Failed to open database: {}", e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| format!("Failed to enable WAL: {}", e))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| format!("Failed to set busy_timeout: {}", e))?;
    Ok(conn)
}

/// Creates every table on first start and applies the forward migrations.
/// Safe to call on every boot.
pub fn init_db(path: &PathBuf) -> Result<(), String> {
    let conn = connect(path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            api_key TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            prefer_shared INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create users table: {}", e))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS antigravity_accounts (
            cookie_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            is_shared INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            needs_reauth INTEGER NOT NULL DEFAULT 0,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at INTEGER NOT NULL DEFAULT 0,
            project_id TEXT,
            is_restricted INTEGER NOT NULL DEFAULT 0,
            ineligible INTEGER NOT NULL DEFAULT 0,
            paid_tier INTEGER NOT NULL DEFAULT 0,
            email TEXT UNIQUE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create antigravity_accounts table: {}", e))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kiro_accounts (
            account_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            is_shared INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            needs_reauth INTEGER NOT NULL DEFAULT 0,
            auth_method TEXT NOT NULL DEFAULT 'social',
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at INTEGER NOT NULL DEFAULT 0,
            client_id TEXT,
            client_secret TEXT,
            profile_arn TEXT,
            machine_id TEXT NOT NULL,
            subscription TEXT,
            current_usage REAL NOT NULL DEFAULT 0,
            usage_limit REAL NOT NULL DEFAULT 0,
            reset_date TEXT,
            free_trial_status TEXT,
            free_trial_usage REAL NOT NULL DEFAULT 0,
            free_trial_limit REAL NOT NULL DEFAULT 0,
            free_trial_expiry TEXT,
            bonus_usage REAL NOT NULL DEFAULT 0,
            bonus_limit REAL NOT NULL DEFAULT 0,
            bonus_available INTEGER NOT NULL DEFAULT 0,
            bonus_details TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create kiro_accounts table: {}", e))?;
    // Forward migration: early deployments predate per-account regions.
    let _ = conn.execute(
        "ALTER TABLE kiro_accounts ADD COLUMN region TEXT NOT NULL DEFAULT 'us-east-1'",
        [],
    );

    conn.execute(
        "CREATE TABLE IF NOT EXISTS qwen_accounts (
            account_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            is_shared INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            needs_reauth INTEGER NOT NULL DEFAULT 0,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at INTEGER NOT NULL DEFAULT 0,
            resource_url TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create qwen_accounts table: {}", e))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS model_quotas (
            cookie_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            remaining REAL NOT NULL DEFAULT 1.0,
            reset_time TEXT,
            available INTEGER NOT NULL DEFAULT 1,
            last_fetched_at INTEGER NOT NULL,
            PRIMARY KEY (cookie_id, model_name)
        )",
        [],
    )
    .map_err(|e| format!("Failed to create model_quotas table: {}", e))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS consumption_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            quota_before REAL NOT NULL,
            quota_after REAL NOT NULL,
            consumed REAL NOT NULL,
            is_shared INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create consumption_log table: {}", e))?;
    let _ = conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_consumption_log_user ON consumption_log(user_id, created_at)",
        [],
    );

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_shared_pool (
            user_id TEXT NOT NULL,
            model_group TEXT NOT NULL,
            quota REAL NOT NULL DEFAULT 0,
            max_quota REAL NOT NULL DEFAULT 0,
            last_recovered_at INTEGER,
            PRIMARY KEY (user_id, model_group)
        )",
        [],
    )
    .map_err(|e| format!("Failed to create user_shared_pool table: {}", e))?;

    Ok(())
}
