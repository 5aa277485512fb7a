use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::models::{AntigravityAccount, KiroAccount, KiroAuthMethod, QwenAccount};

const ANTIGRAVITY_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const ANTIGRAVITY_CLIENT_SECRET: &str = "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";
const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// Refresh endpoints per provider. Tests point these at local mocks.
#[derive(Debug, Clone)]
pub struct TokenEndpoints {
    pub antigravity_token_url: String,
    /// `{region}` is substituted with the account's region.
    pub kiro_social_refresh_url: String,
    pub kiro_idc_token_url: String,
    pub qwen_token_url: String,
}

impl Default for TokenEndpoints {
    fn default() -> Self {
        Self {
            antigravity_token_url: "https://oauth2.googleapis.com/token".to_string(),
            kiro_social_refresh_url: "https://prod.{region}.auth.desktop.kiro.dev/refreshToken"
                .to_string(),
            kiro_idc_token_url: "https://oidc.{region}.amazonaws.com/token".to_string(),
            qwen_token_url: "https://chat.qwen.ai/api/v1/oauth2/token".to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    /// `invalid_grant`: the refresh token is dead, the account is disabled.
    #[error("refresh rejected: invalid_grant")]
    InvalidGrant,
    /// Anything else: the account is marked needs-reauth and skipped.
    #[error("refresh failed: {0}")]
    Transient(String),
}

/// Result of one provider refresh, normalized across token endpoint shapes.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub profile_arn: Option<String>,
    pub resource_url: Option<String>,
}

fn expires_at_from_seconds(expires_in: Option<i64>) -> i64 {
    let seconds = expires_in.unwrap_or(3600);
    chrono::Utc::now().timestamp_millis() + seconds * 1000
}

fn classify_body(status: u16, body: &str) -> RefreshError {
    if body.contains("invalid_grant") {
        RefreshError::InvalidGrant
    } else {
        RefreshError::Transient(format!("token endpoint returned {}: {}", status, body))
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    resource_url: Option<String>,
}

#[derive(Deserialize)]
struct KiroTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: Option<i64>,
    #[serde(rename = "profileArn")]
    profile_arn: Option<String>,
}

pub async fn refresh_antigravity(
    client: &Client,
    endpoints: &TokenEndpoints,
    account: &AntigravityAccount,
) -> Result<RefreshedToken, RefreshError> {
    let response = client
        .post(&endpoints.antigravity_token_url)
        .form(&[
            ("client_id", ANTIGRAVITY_CLIENT_ID),
            ("client_secret", ANTIGRAVITY_CLIENT_SECRET),
            ("refresh_token", account.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| RefreshError::Transient(format!("token request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_body(status.as_u16(), &body));
    }
    let parsed: OAuthTokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Transient(format!("token response unparseable: {}", e)))?;
    Ok(RefreshedToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: expires_at_from_seconds(parsed.expires_in),
        profile_arn: None,
        resource_url: None,
    })
}

pub async fn refresh_kiro(
    client: &Client,
    endpoints: &TokenEndpoints,
    account: &KiroAccount,
) -> Result<RefreshedToken, RefreshError> {
    let response = match account.auth_method {
        KiroAuthMethod::Social => {
            let url = endpoints
                .kiro_social_refresh_url
                .replace("{region}", &account.region);
            client
                .post(&url)
                .json(&json!({"refreshToken": account.refresh_token}))
                .send()
                .await
        }
        KiroAuthMethod::IdC => {
            let url = endpoints
                .kiro_idc_token_url
                .replace("{region}", &account.region);
            let client_id = account.client_id.as_deref().ok_or_else(|| {
                RefreshError::Transient("IdC refresh requires clientId".to_string())
            })?;
            let client_secret = account.client_secret.as_deref().ok_or_else(|| {
                RefreshError::Transient("IdC refresh requires clientSecret".to_string())
            })?;
            client
                .post(&url)
                .json(&json!({
                    "clientId": client_id,
                    "clientSecret": client_secret,
                    "refreshToken": account.refresh_token,
                    "grantType": "refresh_token",
                }))
                .send()
                .await
        }
    }
    .map_err(|e| RefreshError::Transient(format!("token request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_body(status.as_u16(), &body));
    }
    let parsed: KiroTokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Transient(format!("token response unparseable: {}", e)))?;
    Ok(RefreshedToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: expires_at_from_seconds(parsed.expires_in),
        profile_arn: parsed.profile_arn,
        resource_url: None,
    })
}

pub async fn refresh_qwen(
    client: &Client,
    endpoints: &TokenEndpoints,
    account: &QwenAccount,
) -> Result<RefreshedToken, RefreshError> {
    let response = client
        .post(&endpoints.qwen_token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", account.refresh_token.as_str()),
            ("client_id", QWEN_CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| RefreshError::Transient(format!("token request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_body(status.as_u16(), &body));
    }
    let parsed: OAuthTokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Transient(format!("token response unparseable: {}", e)))?;
    Ok(RefreshedToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: expires_at_from_seconds(parsed.expires_in),
        profile_arn: None,
        resource_url: parsed.resource_url,
    })
}
