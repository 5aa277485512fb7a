use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Key authorizing the account-management routes.
    #[serde(default)]
    pub admin_key: String,
    /// Where the companion OAuth helper posts provider callbacks.
    #[serde(default = "default_oauth_callback_url")]
    pub oauth_callback_url: String,
    /// Subscription tier -> model ids a Kiro account of that tier may serve.
    /// Empty map keeps the legacy allow-all behavior.
    #[serde(default)]
    pub kiro_tier_models: HashMap<String, Vec<String>>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8317,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "switchyard.db".to_string(),
        }
    }
}

fn default_oauth_callback_url() -> String {
    "http://localhost:42532/oauth-callback".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            admin_key: String::new(),
            oauth_callback_url: default_oauth_callback_url(),
            kiro_tier_models: HashMap::new(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }

    /// Model ids a Kiro account of `tier` may serve. `None` means the tier
    /// table is empty and every model is allowed; with a populated table an
    /// unknown tier gets an empty allowance.
    pub fn kiro_allowed_models(&self, tier: Option<&str>) -> Option<Vec<String>> {
        if self.kiro_tier_models.is_empty() {
            return None;
        }
        Some(
            tier.and_then(|t| self.kiro_tier_models.get(t))
                .cloned()
                .unwrap_or_default(),
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tier_table_allows_all_models() {
        let config = AppConfig::new();
        assert!(config.kiro_allowed_models(Some("FREE")).is_none());
        assert!(config.kiro_allowed_models(None).is_none());
    }

    #[test]
    fn populated_tier_table_restricts_by_subscription() {
        let mut config = AppConfig::new();
        config.kiro_tier_models.insert(
            "FREE".to_string(),
            vec!["claude-haiku-4-5".to_string()],
        );

        let allowed = config.kiro_allowed_models(Some("FREE")).unwrap();
        assert_eq!(allowed, ["claude-haiku-4-5".to_string()]);
        // Unknown tier with a populated table resolves to an empty allowance.
        assert!(config.kiro_allowed_models(Some("ULTRA")).unwrap().is_empty());
    }
}
