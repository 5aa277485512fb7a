use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::constants::{ONBOARD_POLL_ATTEMPTS, ONBOARD_POLL_INTERVAL_SECS};
use crate::models::AntigravityAccount;
use crate::modules::persistence::AccountStore;
use crate::proxy::dispatch::endpoints::ApiEndpoint;

/// Upstream requires a GCP-side project id in every generate body. A stored
/// id is reused; otherwise one is minted via `loadCodeAssist`, falling back
/// to `onboardUser` (a long-running operation polled until `done`), and
/// persisted together with the eligibility flags.
pub async fn ensure_project_id(
    client: &Client,
    endpoint: &ApiEndpoint,
    store: &Arc<AccountStore>,
    account: &AntigravityAccount,
    force: bool,
) -> Result<String, String> {
    if !force {
        if let Some(project_id) = account.project_id.as_deref() {
            if !project_id.is_empty() {
                return Ok(project_id.to_string());
            }
        }
    }

    let load = call_v1(client, &endpoint.load_code_assist_url(), &account.access_token, &json!({
        "metadata": {"ideType": "ANTIGRAVITY"}
    }))
    .await?;

    let paid_tier = load
        .get("currentTier")
        .and_then(|t| t.get("id"))
        .and_then(|id| id.as_str())
        .map(|id| id != "free-tier")
        .unwrap_or(false);

    if let Some(project_id) = load.get("cloudaicompanionProject").and_then(|p| p.as_str()) {
        store.update_project_ids(&account.cookie_id, project_id, account.is_restricted, false, paid_tier)?;
        return Ok(project_id.to_string());
    }

    // No companion project yet: onboard and poll the operation.
    for attempt in 0..ONBOARD_POLL_ATTEMPTS {
        let onboard = call_v1(
            client,
            &endpoint.onboard_user_url(),
            &account.access_token,
            &json!({
                "tierId": "free-tier",
                "metadata": {"ideType": "ANTIGRAVITY"}
            }),
        )
        .await?;

        if onboard.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
            if let Some(project_id) = onboard
                .get("response")
                .and_then(|r| r.get("cloudaicompanionProject"))
                .and_then(|p| p.get("id"))
                .and_then(|id| id.as_str())
            {
                store.update_project_ids(
                    &account.cookie_id,
                    project_id,
                    account.is_restricted,
                    false,
                    paid_tier,
                )?;
                return Ok(project_id.to_string());
            }
            break;
        }
        if attempt + 1 < ONBOARD_POLL_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_secs(ONBOARD_POLL_INTERVAL_SECS)).await;
        }
    }

    // Ineligible account: a generated id still unblocks most models.
    let mock_id = generate_mock_project_id();
    tracing::warn!(
        "Account {} ineligible for an official project id, using generated fallback: {}",
        account.cookie_id,
        mock_id
    );
    store.update_project_ids(&account.cookie_id, &mock_id, account.is_restricted, true, paid_tier)?;
    Ok(mock_id)
}

async fn call_v1(
    client: &Client,
    url: &str,
    access_token: &str,
    body: &Value,
) -> Result<Value, String> {
    let response = client
        .post(url)
        .bearer_auth(access_token)
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| format!("request to {} failed: {}", url, e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("{} returned {}: {}", url, status, body));
    }
    response
        .json()
        .await
        .map_err(|e| format!("failed to parse response from {}: {}", url, e))
}

// Format: {adjective}-{noun}-{5 base36 chars}, matching real companion ids
// closely enough for the generate endpoints.
pub fn generate_mock_project_id() -> String {
    let adjectives = ["useful", "bright", "swift", "calm", "bold"];
    let nouns = ["fuze", "wave", "spark", "flow", "core"];

    let mut rng = rand::thread_rng();
    let adj = adjectives[rng.gen_range(0..adjectives.len())];
    let noun = nouns[rng.gen_range(0..nouns.len())];
    let chars = "abcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = (0..5)
        .map(|_| {
            let idx = rng.gen_range(0..chars.len());
            chars.as_bytes()[idx] as char
        })
        .collect();

    format!("{}-{}-{}", adj, noun, suffix)
}
