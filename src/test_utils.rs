#![cfg(test)]

use std::path::PathBuf;

use crate::models::{
    AccountStatus, AntigravityAccount, KiroAccount, KiroAuthMethod, KiroUsage, QwenAccount,
    SharedFlag, SharingPreference, User,
};
use crate::modules::persistence::{AccountStore, QuotaLedgerDb};

pub(crate) struct ScopedEnvVar {
    key: &'static str,
    original: Option<String>,
}

impl ScopedEnvVar {
    pub(crate) fn set(key: &'static str, value: &str) -> Self {
        let original = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, original }
    }
}

impl Drop for ScopedEnvVar {
    fn drop(&mut self) {
        if let Some(value) = self.original.as_deref() {
            std::env::set_var(self.key, value);
        } else {
            std::env::remove_var(self.key);
        }
    }
}

pub(crate) fn temp_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    crate::modules::persistence::db::init_db(&path).expect("init db");
    (dir, path)
}

pub(crate) fn open_store() -> (tempfile::TempDir, AccountStore) {
    let (dir, path) = temp_db();
    (dir, AccountStore::new(path))
}

pub(crate) fn open_store_and_ledger() -> (tempfile::TempDir, AccountStore, QuotaLedgerDb) {
    let (dir, path) = temp_db();
    (dir, AccountStore::new(path.clone()), QuotaLedgerDb::new(path))
}

pub(crate) fn user_fixture(id: &str) -> User {
    User {
        id: id.to_string(),
        api_key: format!("sk-{}", id),
        name: format!("user {}", id),
        prefer_shared: SharingPreference::PreferDedicated,
        status: AccountStatus::Enabled,
    }
}

pub(crate) fn antigravity_fixture(
    cookie_id: &str,
    user_id: &str,
    shared: SharedFlag,
) -> AntigravityAccount {
    AntigravityAccount {
        cookie_id: cookie_id.to_string(),
        user_id: user_id.to_string(),
        shared,
        status: AccountStatus::Enabled,
        needs_reauth: false,
        access_token: format!("access-{}", cookie_id),
        refresh_token: format!("refresh-{}", cookie_id),
        expires_at: chrono::Utc::now().timestamp_millis() + 3_600_000,
        project_id: Some(format!("project-{}", cookie_id)),
        is_restricted: false,
        ineligible: false,
        paid_tier: false,
        email: None,
    }
}

pub(crate) fn kiro_fixture(account_id: &str, user_id: &str, shared: SharedFlag) -> KiroAccount {
    KiroAccount {
        account_id: account_id.to_string(),
        user_id: user_id.to_string(),
        shared,
        status: AccountStatus::Enabled,
        needs_reauth: false,
        auth_method: KiroAuthMethod::Social,
        access_token: format!("access-{}", account_id),
        refresh_token: format!("refresh-{}", account_id),
        expires_at: chrono::Utc::now().timestamp_millis() + 3_600_000,
        client_id: None,
        client_secret: None,
        profile_arn: Some("arn:aws:codewhisperer:us-east-1:0:profile/TEST".to_string()),
        machine_id: "machine-test".to_string(),
        region: "us-east-1".to_string(),
        usage: KiroUsage::default(),
    }
}

pub(crate) fn qwen_fixture(account_id: &str, user_id: &str, shared: SharedFlag) -> QwenAccount {
    QwenAccount {
        account_id: account_id.to_string(),
        user_id: user_id.to_string(),
        shared,
        status: AccountStatus::Enabled,
        needs_reauth: false,
        access_token: format!("access-{}", account_id),
        refresh_token: format!("refresh-{}", account_id),
        expires_at: chrono::Utc::now().timestamp_millis() + 3_600_000,
        resource_url: None,
    }
}
