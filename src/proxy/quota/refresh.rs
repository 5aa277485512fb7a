use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::constants::QUOTA_REFRESH_WORKERS;
use crate::modules::persistence::QuotaLedgerDb;

/// Fire-and-forget models-list refresher. Bounded by a small worker pool
/// and a per-account in-flight set, so a cold cache under a request burst
/// cannot fan out N identical upstream calls for one account.
pub struct QuotaRefresher {
    client: Client,
    db: QuotaLedgerDb,
    permits: Arc<Semaphore>,
    in_flight: DashMap<String, ()>,
}

/// Extracts `(model, remaining fraction, reset time, availability)` tuples
/// from a models-list response. Both the fractional and the percentage
/// representation appear in the wild.
pub fn parse_models_quotas(value: &Value) -> Vec<(String, f64, Option<String>, bool)> {
    let Some(models) = value.get("models").and_then(|m| m.as_array()) else {
        return Vec::new();
    };
    models
        .iter()
        .filter_map(|entry| {
            let name = entry
                .get("model")
                .or_else(|| entry.get("name"))
                .and_then(|n| n.as_str())?
                .to_string();
            let remaining = entry
                .get("remainingFraction")
                .and_then(|f| f.as_f64())
                .or_else(|| {
                    entry
                        .get("percentage")
                        .and_then(|p| p.as_f64())
                        .map(|p| p / 100.0)
                })?;
            let reset_time = entry
                .get("resetTime")
                .and_then(|r| r.as_str())
                .map(str::to_string);
            let available = entry
                .get("available")
                .and_then(|a| a.as_bool())
                .unwrap_or(remaining > 0.0);
            Some((name, remaining.clamp(0.0, 1.0), reset_time, available))
        })
        .collect()
}

impl QuotaRefresher {
    pub fn new(db: QuotaLedgerDb) -> Self {
        Self {
            client: crate::utils::http::SHARED_CLIENT_SHORT.clone(),
            db,
            permits: Arc::new(Semaphore::new(QUOTA_REFRESH_WORKERS)),
            in_flight: DashMap::new(),
        }
    }

    /// One models-list fetch, upserted into the cache. Used synchronously
    /// after stream completion and from the background path.
    pub async fn refresh_now(
        &self,
        cookie_id: &str,
        access_token: &str,
        models_url: &str,
    ) -> Result<(), String> {
        let response = self
            .client
            .post(models_url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| format!("models-list request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("models-list returned {}", status));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| format!("models-list response unparseable: {}", e))?;
        let quotas = parse_models_quotas(&value);
        if quotas.is_empty() {
            return Err("models-list carried no quota entries".to_string());
        }
        self.db.upsert_quotas(cookie_id, &quotas)
    }

    /// Best-effort background refresh; errors are logged only. Duplicate
    /// requests for an account already being refreshed are dropped.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        cookie_id: String,
        access_token: String,
        models_url: String,
    ) {
        if self.in_flight.insert(cookie_id.clone(), ()).is_some() {
            return;
        }
        let refresher = self.clone();
        tokio::spawn(async move {
            let _permit = match refresher.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    refresher.in_flight.remove(&cookie_id);
                    return;
                }
            };
            if let Err(e) = refresher
                .refresh_now(&cookie_id, &access_token, &models_url)
                .await
            {
                tracing::debug!("Background quota refresh for {} failed: {}", cookie_id, e);
            }
            refresher.in_flight.remove(&cookie_id);
        });
    }
}
