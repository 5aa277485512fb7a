use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::constants::TOKEN_REFRESH_SAFETY_MS;
use crate::models::{AntigravityAccount, KiroAccount, Provider, QwenAccount};
use crate::modules::persistence::AccountStore;
use crate::proxy::token::refresh::{self, RefreshError, TokenEndpoints};

/// Produces a usable access token for an account, refreshing through the
/// provider's token endpoint when the stored one is about to lapse.
///
/// Refreshes are serialized per account id: concurrent callers share one
/// in-flight network refresh, while different accounts refresh in parallel.
pub struct TokenManager {
    store: Arc<AccountStore>,
    client: Client,
    endpoints: TokenEndpoints,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(store: Arc<AccountStore>, endpoints: TokenEndpoints) -> Self {
        Self {
            store,
            client: crate::utils::http::SHARED_CLIENT_SHORT.clone(),
            endpoints,
            refresh_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns the account with a token valid for at least the safety
    /// margin. `proactive` forces a refresh regardless of expiry.
    pub async fn ensure_fresh_antigravity(
        &self,
        cookie_id: &str,
        proactive: bool,
    ) -> Result<AntigravityAccount, RefreshError> {
        let account = self
            .store
            .get_antigravity(cookie_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", cookie_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        let lock = self.lock_for(cookie_id);
        let _guard = lock.lock().await;

        // Re-read: a queued caller usually finds the token already renewed.
        let account = self
            .store
            .get_antigravity(cookie_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", cookie_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        match refresh::refresh_antigravity(&self.client, &self.endpoints, &account).await {
            Ok(token) => {
                self.store
                    .update_antigravity_token(
                        cookie_id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        token.expires_at,
                    )
                    .map_err(RefreshError::Transient)?;
                self.store
                    .get_antigravity(cookie_id)
                    .map_err(RefreshError::Transient)?
                    .ok_or_else(|| {
                        RefreshError::Transient(format!("account {} vanished", cookie_id))
                    })
            }
            Err(e) => Err(self.handle_failure(Provider::Antigravity, cookie_id, e)),
        }
    }

    pub async fn ensure_fresh_kiro(
        &self,
        account_id: &str,
        proactive: bool,
    ) -> Result<KiroAccount, RefreshError> {
        let account = self
            .store
            .get_kiro(account_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", account_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let account = self
            .store
            .get_kiro(account_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", account_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        match refresh::refresh_kiro(&self.client, &self.endpoints, &account).await {
            Ok(token) => {
                self.store
                    .update_kiro_token(
                        account_id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        token.expires_at,
                        token.profile_arn.as_deref(),
                    )
                    .map_err(RefreshError::Transient)?;
                self.store
                    .get_kiro(account_id)
                    .map_err(RefreshError::Transient)?
                    .ok_or_else(|| {
                        RefreshError::Transient(format!("account {} vanished", account_id))
                    })
            }
            Err(e) => Err(self.handle_failure(Provider::Kiro, account_id, e)),
        }
    }

    pub async fn ensure_fresh_qwen(
        &self,
        account_id: &str,
        proactive: bool,
    ) -> Result<QwenAccount, RefreshError> {
        let account = self
            .store
            .get_qwen(account_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", account_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let account = self
            .store
            .get_qwen(account_id)
            .map_err(RefreshError::Transient)?
            .ok_or_else(|| RefreshError::Transient(format!("account {} not found", account_id)))?;
        if !proactive && !account.token_expires_within(TOKEN_REFRESH_SAFETY_MS) {
            return Ok(account);
        }

        match refresh::refresh_qwen(&self.client, &self.endpoints, &account).await {
            Ok(token) => {
                self.store
                    .update_qwen_token(
                        account_id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        token.expires_at,
                        token.resource_url.as_deref(),
                    )
                    .map_err(RefreshError::Transient)?;
                self.store
                    .get_qwen(account_id)
                    .map_err(RefreshError::Transient)?
                    .ok_or_else(|| {
                        RefreshError::Transient(format!("account {} vanished", account_id))
                    })
            }
            Err(e) => Err(self.handle_failure(Provider::Qwen, account_id, e)),
        }
    }

    /// Permanent failures disable the account; transient ones flag it for
    /// re-auth so dispatch skips it and moves on.
    fn handle_failure(
        &self,
        provider: Provider,
        account_id: &str,
        error: RefreshError,
    ) -> RefreshError {
        match &error {
            RefreshError::InvalidGrant => {
                tracing::warn!(
                    "Disabling {} account {} after invalid_grant",
                    provider.as_str(),
                    account_id
                );
                if let Err(e) = self
                    .store
                    .set_status(provider, account_id, crate::models::AccountStatus::Disabled)
                {
                    tracing::error!("Failed to disable account {}: {}", account_id, e);
                }
            }
            RefreshError::Transient(msg) => {
                tracing::warn!(
                    "Marking {} account {} needs_reauth after refresh failure: {}",
                    provider.as_str(),
                    account_id,
                    msg
                );
                if let Err(e) = self.store.mark_needs_reauth(provider, account_id) {
                    tracing::error!("Failed to mark needs_reauth for {}: {}", account_id, e);
                }
            }
        }
        error
    }
}
