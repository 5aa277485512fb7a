use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Antigravity,
    Kiro,
    Qwen,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Antigravity => "antigravity",
            Provider::Kiro => "kiro",
            Provider::Qwen => "qwen",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "antigravity" => Ok(Provider::Antigravity),
            "kiro" => Ok(Provider::Kiro),
            "qwen" => Ok(Provider::Qwen),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Enabled,
    Disabled,
}

impl AccountStatus {
    pub fn from_i64(v: i64) -> Self {
        if v == 0 {
            AccountStatus::Disabled
        } else {
            AccountStatus::Enabled
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            AccountStatus::Enabled => 1,
            AccountStatus::Disabled => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedFlag {
    Dedicated,
    Shared,
}

impl SharedFlag {
    pub fn from_i64(v: i64) -> Self {
        if v == 0 {
            SharedFlag::Dedicated
        } else {
            SharedFlag::Shared
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            SharedFlag::Dedicated => 0,
            SharedFlag::Shared => 1,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, SharedFlag::Shared)
    }
}

/// Which pool a user's requests drain first when both are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPreference {
    PreferDedicated,
    PreferShared,
}

impl SharingPreference {
    pub fn from_i64(v: i64) -> Self {
        if v == 0 {
            SharingPreference::PreferDedicated
        } else {
            SharingPreference::PreferShared
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            SharingPreference::PreferDedicated => 0,
            SharingPreference::PreferShared => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub api_key: String,
    pub name: String,
    pub prefer_shared: SharingPreference,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntigravityAccount {
    pub cookie_id: String,
    pub user_id: String,
    pub shared: SharedFlag,
    pub status: AccountStatus,
    pub needs_reauth: bool,
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub project_id: Option<String>,
    pub is_restricted: bool,
    pub ineligible: bool,
    pub paid_tier: bool,
    pub email: Option<String>,
}

impl AntigravityAccount {
    pub fn token_expires_within(&self, margin_ms: i64) -> bool {
        self.expires_at - chrono::Utc::now().timestamp_millis() < margin_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KiroAuthMethod {
    Social,
    IdC,
}

impl KiroAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KiroAuthMethod::Social => "social",
            KiroAuthMethod::IdC => "idc",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("idc") {
            KiroAuthMethod::IdC
        } else {
            KiroAuthMethod::Social
        }
    }
}

/// Usage counters reported by the Kiro subscription endpoint, persisted on
/// the account row after each completed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiroUsage {
    pub subscription: Option<String>,
    pub current_usage: f64,
    pub usage_limit: f64,
    pub reset_date: Option<String>,
    pub free_trial_status: Option<String>,
    pub free_trial_usage: f64,
    pub free_trial_limit: f64,
    pub free_trial_expiry: Option<String>,
    pub bonus_usage: f64,
    pub bonus_limit: f64,
    pub bonus_available: bool,
    pub bonus_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroAccount {
    pub account_id: String,
    pub user_id: String,
    pub shared: SharedFlag,
    pub status: AccountStatus,
    pub needs_reauth: bool,
    pub auth_method: KiroAuthMethod,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    /// IdC device registration; absent for social logins.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub profile_arn: Option<String>,
    pub machine_id: String,
    pub region: String,
    pub usage: KiroUsage,
}

impl KiroAccount {
    pub fn token_expires_within(&self, margin_ms: i64) -> bool {
        self.expires_at - chrono::Utc::now().timestamp_millis() < margin_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenAccount {
    pub account_id: String,
    pub user_id: String,
    pub shared: SharedFlag,
    pub status: AccountStatus,
    pub needs_reauth: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    /// Per-tenant API base host returned by the token endpoint.
    pub resource_url: Option<String>,
}

impl QwenAccount {
    pub fn token_expires_within(&self, margin_ms: i64) -> bool {
        self.expires_at - chrono::Utc::now().timestamp_millis() < margin_ms
    }

    pub fn api_base(&self) -> String {
        let host = self
            .resource_url
            .as_deref()
            .unwrap_or("portal.qwen.ai")
            .trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        }
    }
}
