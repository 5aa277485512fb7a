use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::constants::{force_sse_for_model, MAX_PROJECT_RETRIES, MAX_QUOTA_SWAPS};
use crate::models::{
    AntigravityAccount, AppConfig, KiroAccount, Provider, QwenAccount, User,
};
use crate::modules::persistence::AccountStore;
use crate::proxy::codec::{antigravity, kiro, qwen};
use crate::proxy::dispatch::endpoints::{ApiEndpoint, EndpointTable};
use crate::proxy::dispatch::errors::{
    classify_antigravity_failure, DispatchError, Error403Class, FailureClass,
};
use crate::proxy::dispatch::{project, selection};
use crate::proxy::events::StreamEvent;
use crate::proxy::quota::QuotaLedger;
use crate::proxy::token::TokenManager;

/// Counters carried across the retry matrix of one request.
#[derive(Debug, Default)]
struct DispatchState {
    exclude: HashSet<String>,
    endpoint_index: usize,
    first_error_403: Option<Error403Class>,
    project_retry_count: u32,
    quota_swap_count: u32,
}

/// What the engine reports back after a clean completion.
#[derive(Debug)]
pub struct DispatchSummary {
    pub account_id: String,
    pub consumed: f64,
    /// Locally aggregated body for non-streaming callers.
    pub response: Option<Value>,
}

pub type Sink<'a> = dyn FnMut(StreamEvent) + Send + 'a;

/// Orchestrates account selection, token freshness, the (endpoint x account)
/// retry matrix and the ledger side effects of a completed request. One
/// instance serves all providers; collaborators are injected.
pub struct DispatchEngine {
    store: Arc<AccountStore>,
    ledger: Arc<QuotaLedger>,
    tokens: Arc<TokenManager>,
    endpoints: EndpointTable,
    kiro_api_base: String,
    config: Arc<AppConfig>,
    client: Client,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<AccountStore>,
        ledger: Arc<QuotaLedger>,
        tokens: Arc<TokenManager>,
        endpoints: EndpointTable,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            ledger,
            tokens,
            endpoints,
            kiro_api_base: "https://codewhisperer.{region}.amazonaws.com".to_string(),
            config,
            client: crate::utils::http::SHARED_CLIENT.clone(),
        }
    }

    /// Test hook: points the Kiro API at a mock; `{region}` is substituted.
    pub fn with_kiro_api_base(mut self, base: impl Into<String>) -> Self {
        self.kiro_api_base = base.into();
        self
    }

    fn disable(&self, provider: Provider, account_id: &str, why: &str) {
        tracing::warn!("Disabling {} account {}: {}", provider.as_str(), account_id, why);
        if let Err(e) = self
            .store
            .set_status(provider, account_id, crate::models::AccountStatus::Disabled)
        {
            tracing::error!("Failed to disable account {}: {}", account_id, e);
        }
    }

    // ---- antigravity ----

    fn select_antigravity(
        &self,
        user: &User,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Result<Option<AntigravityAccount>, DispatchError> {
        let pool = self
            .store
            .get_available_antigravity(&user.id, None)
            .map_err(DispatchError::Store)?;
        let pool = selection::filter_excluded(pool, exclude, |a| a.cookie_id.as_str());
        let mut available = Vec::new();
        for account in pool {
            if self
                .ledger
                .account_available(&user.id, &account.cookie_id, model, account.shared)
                .map_err(DispatchError::Store)?
            {
                available.push(account);
            }
        }
        Ok(selection::choose_by_preference(
            available,
            user.prefer_shared,
            |a| a.shared,
        ))
    }

    pub async fn dispatch_antigravity(
        &self,
        user: &User,
        model: &str,
        request: &Value,
        stream: bool,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut state = DispatchState::default();

        'account: loop {
            let Some(account) = self.select_antigravity(user, model, &state.exclude)? else {
                return Err(DispatchError::ResourceExhausted);
            };
            let account = match self
                .tokens
                .ensure_fresh_antigravity(&account.cookie_id, false)
                .await
            {
                Ok(account) => account,
                Err(e) => {
                    // invalid_grant already disabled the row; a transient
                    // failure flagged it. Either way: skip and reselect.
                    tracing::warn!("Skipping account {}: {}", account.cookie_id, e);
                    state.exclude.insert(account.cookie_id.clone());
                    continue 'account;
                }
            };

            let mut project_id = match project::ensure_project_id(
                &self.client,
                self.endpoints.first(),
                &self.store,
                &account,
                false,
            )
            .await
            {
                Ok(project_id) => project_id,
                Err(e) => {
                    tracing::warn!(
                        "Project resolution failed for {}: {}",
                        account.cookie_id,
                        e
                    );
                    state.exclude.insert(account.cookie_id.clone());
                    continue 'account;
                }
            };

            if self
                .ledger
                .quota_is_stale(&account.cookie_id, model)
                .unwrap_or(false)
            {
                self.ledger.refresher().spawn_refresh(
                    account.cookie_id.clone(),
                    account.access_token.clone(),
                    self.endpoints.first().models_list_url(),
                );
            }

            state.endpoint_index = 0;
            'endpoint: loop {
                let endpoint = self
                    .endpoints
                    .get(state.endpoint_index)
                    .expect("endpoint index is bounds-checked before advancing");

                let use_sse = stream || force_sse_for_model(model);
                let url = if use_sse {
                    endpoint.stream_generate_url()
                } else {
                    endpoint.generate_content_url()
                };
                let body = antigravity::build_request_body(model, &project_id, request);
                let mut req = self
                    .client
                    .post(&url)
                    .bearer_auth(&account.access_token)
                    .header("Content-Type", "application/json");
                if use_sse {
                    req = req.header("Accept", "text/event-stream");
                }
                let response = req
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| DispatchError::Network(e.to_string()))?;

                if response.status().is_success() {
                    return if use_sse {
                        self.finish_antigravity_stream(
                            response, user, &account, model, endpoint, stream, sink,
                        )
                        .await
                    } else {
                        self.finish_antigravity_unary(response, user, &account, model, endpoint, sink)
                            .await
                    };
                }

                let status = response.status().as_u16();
                let body_text = response.text().await.unwrap_or_default();
                tracing::debug!(
                    "Upstream {} on endpoint {} for account {}: {}",
                    status,
                    endpoint.host,
                    account.cookie_id,
                    body_text
                );

                match classify_antigravity_failure(status, &body_text) {
                    FailureClass::ProjectInvalid => {
                        if state.project_retry_count < MAX_PROJECT_RETRIES {
                            state.project_retry_count += 1;
                            match project::ensure_project_id(
                                &self.client,
                                self.endpoints.first(),
                                &self.store,
                                &account,
                                true,
                            )
                            .await
                            {
                                Ok(fresh) => {
                                    project_id = fresh;
                                    continue 'endpoint;
                                }
                                Err(e) => {
                                    self.disable(
                                        Provider::Antigravity,
                                        &account.cookie_id,
                                        &format!("project re-mint failed: {}", e),
                                    );
                                    state.exclude.insert(account.cookie_id.clone());
                                    continue 'account;
                                }
                            }
                        }
                        self.disable(
                            Provider::Antigravity,
                            &account.cookie_id,
                            "project id rejected twice",
                        );
                        state.exclude.insert(account.cookie_id.clone());
                        continue 'account;
                    }
                    FailureClass::QuotaExhausted => {
                        state.exclude.insert(account.cookie_id.clone());
                        continue 'account;
                    }
                    FailureClass::ImageTooLarge => return Err(DispatchError::ImageTooLarge),
                    FailureClass::InvalidArgument => {
                        return Err(DispatchError::InvalidArgument { body: body_text })
                    }
                    FailureClass::BadRequestOther => {
                        self.disable(Provider::Antigravity, &account.cookie_id, "fatal 400");
                        return Err(DispatchError::AccountDisabled {
                            status,
                            body: body_text,
                        });
                    }
                    FailureClass::Forbidden(class) => {
                        if state.first_error_403.is_none() {
                            state.first_error_403 = Some(class);
                        }
                        state.endpoint_index += 1;
                        if state.endpoint_index >= self.endpoints.len() {
                            let permission_denied =
                                state.first_error_403 == Some(Error403Class::PermissionDenied);
                            if !permission_denied {
                                self.disable(
                                    Provider::Antigravity,
                                    &account.cookie_id,
                                    "403 on every endpoint",
                                );
                            }
                            return Err(DispatchError::AllEndpoints403 { permission_denied });
                        }
                        continue 'endpoint;
                    }
                    FailureClass::RateLimited => {
                        state.endpoint_index += 1;
                        if state.endpoint_index >= self.endpoints.len() {
                            if state.quota_swap_count >= MAX_QUOTA_SWAPS {
                                return Err(DispatchError::ResourceExhausted);
                            }
                            state.quota_swap_count += 1;
                            state.exclude.insert(account.cookie_id.clone());
                            continue 'account;
                        }
                        continue 'endpoint;
                    }
                    FailureClass::IllegalPrompt => return Err(DispatchError::IllegalPrompt),
                    FailureClass::ServerError => {
                        state.endpoint_index += 1;
                        if state.endpoint_index >= self.endpoints.len() {
                            return Err(DispatchError::Upstream {
                                status,
                                body: body_text,
                            });
                        }
                        continue 'endpoint;
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_antigravity_stream(
        &self,
        response: reqwest::Response,
        user: &User,
        account: &AntigravityAccount,
        model: &str,
        endpoint: &ApiEndpoint,
        stream: bool,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let quota_before = self
            .ledger
            .get_quota(&account.cookie_id, model)
            .map_err(DispatchError::Store)?
            .map(|row| row.remaining)
            .unwrap_or(1.0);

        let mut parser = antigravity::StreamParser::new();
        let mut aggregator = (!stream).then(antigravity::NonStreamAggregator::new);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DispatchError::Network(format!("stream read failed: {}", e)))?;
            for event in parser.feed(&chunk) {
                if let Some(agg) = aggregator.as_mut() {
                    agg.push(&event);
                }
                sink(event);
            }
        }
        for event in parser.finish() {
            if let Some(agg) = aggregator.as_mut() {
                agg.push(&event);
            }
            sink(event);
        }

        let consumed = self
            .settle_consumption(user, account, model, endpoint, quota_before)
            .await?;
        Ok(DispatchSummary {
            account_id: account.cookie_id.clone(),
            consumed,
            response: aggregator.map(|a| a.into_response()),
        })
    }

    async fn finish_antigravity_unary(
        &self,
        response: reqwest::Response,
        user: &User,
        account: &AntigravityAccount,
        model: &str,
        endpoint: &ApiEndpoint,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let quota_before = self
            .ledger
            .get_quota(&account.cookie_id, model)
            .map_err(DispatchError::Store)?
            .map(|row| row.remaining)
            .unwrap_or(1.0);

        let value: Value = response
            .json()
            .await
            .map_err(|e| DispatchError::Network(format!("response unparseable: {}", e)))?;
        for event in antigravity::parse_unary_response(&value) {
            sink(event);
        }

        let consumed = self
            .settle_consumption(user, account, model, endpoint, quota_before)
            .await?;
        Ok(DispatchSummary {
            account_id: account.cookie_id.clone(),
            consumed,
            response: Some(value),
        })
    }

    /// Post-completion accounting: refresh the account's quotas from the
    /// models list (best effort), then append the consumption row computed
    /// from the before/after fractions.
    async fn settle_consumption(
        &self,
        user: &User,
        account: &AntigravityAccount,
        model: &str,
        endpoint: &ApiEndpoint,
        quota_before: f64,
    ) -> Result<f64, DispatchError> {
        let refresher = self.ledger.refresher();
        let quota_after = match refresher
            .refresh_now(
                &account.cookie_id,
                &account.access_token,
                &endpoint.models_list_url(),
            )
            .await
        {
            Ok(()) => self
                .ledger
                .get_quota(&account.cookie_id, model)
                .map_err(DispatchError::Store)?
                .map(|row| row.remaining)
                .unwrap_or(quota_before),
            Err(e) => {
                tracing::debug!(
                    "Post-request quota refresh failed for {}: {}",
                    account.cookie_id,
                    e
                );
                quota_before
            }
        };
        self.ledger
            .record_consumption(
                &user.id,
                &account.cookie_id,
                model,
                quota_before,
                quota_after,
                account.shared,
            )
            .map_err(DispatchError::Store)
    }

    // ---- kiro ----

    fn select_kiro(
        &self,
        user: &User,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Result<Option<KiroAccount>, DispatchError> {
        let pool = self
            .store
            .get_available_kiro(&user.id, None)
            .map_err(DispatchError::Store)?;
        let pool = selection::filter_excluded(pool, exclude, |a| a.account_id.as_str());
        let mut available = Vec::new();
        for account in pool {
            if let Some(allowed) = self
                .config
                .kiro_allowed_models(account.usage.subscription.as_deref())
            {
                if !allowed.iter().any(|m| m == model) {
                    continue;
                }
            }
            if self
                .ledger
                .account_available(&user.id, &account.account_id, model, account.shared)
                .map_err(DispatchError::Store)?
            {
                available.push(account);
            }
        }
        Ok(selection::choose_by_preference(
            available,
            user.prefer_shared,
            |a| a.shared,
        ))
    }

    fn kiro_headers(account: &KiroAccount) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = format!("Bearer {}", account.access_token).parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().expect("static header"),
        );
        // The machine id rides inside both user agents.
        let ua = format!(
            "aws-sdk-js/1.0.27 ua/2.1 api/codewhispererstreaming#1.0.27 m/E KiroIDE-{}",
            account.machine_id
        );
        if let Ok(value) = ua.parse() {
            headers.insert(reqwest::header::USER_AGENT, value);
        }
        if let Ok(value) = format!("aws-sdk-js/1.0.27 KiroIDE-{}", account.machine_id).parse() {
            headers.insert("x-amz-user-agent", value);
        }
        headers.insert(
            "x-amzn-codewhisperer-optout",
            "true".parse().expect("static header"),
        );
        if let Ok(value) = uuid::Uuid::new_v4().to_string().parse() {
            headers.insert("amz-sdk-invocation-id", value);
        }
        headers
    }

    pub async fn dispatch_kiro(
        &self,
        user: &User,
        model: &str,
        request: &Value,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut state = DispatchState::default();

        loop {
            let Some(account) = self.select_kiro(user, model, &state.exclude)? else {
                return Err(DispatchError::ResourceExhausted);
            };
            let account = match self.tokens.ensure_fresh_kiro(&account.account_id, false).await {
                Ok(account) => account,
                Err(e) => {
                    tracing::warn!("Skipping account {}: {}", account.account_id, e);
                    state.exclude.insert(account.account_id.clone());
                    continue;
                }
            };

            let url = format!(
                "{}/generateAssistantResponse",
                self.kiro_api_base.replace("{region}", &account.region)
            );
            let conversation_id = uuid::Uuid::new_v4().to_string();
            let body = kiro::build_request_body(
                model,
                account.profile_arn.as_deref(),
                &conversation_id,
                request,
            );
            let response = self
                .client
                .post(&url)
                .headers(Self::kiro_headers(&account))
                .json(&body)
                .send()
                .await
                .map_err(|e| DispatchError::Network(e.to_string()))?;

            if response.status().is_success() {
                return self.finish_kiro_stream(response, user, &account, model, sink).await;
            }

            let status = response.status().as_u16();
            let body_text = response.text().await.unwrap_or_default();
            match status {
                // Billing and permission failures are fatal for the account.
                402 | 403 => {
                    self.disable(
                        Provider::Kiro,
                        &account.account_id,
                        &format!("upstream {}", status),
                    );
                    return Err(DispatchError::AccountDisabled {
                        status,
                        body: body_text,
                    });
                }
                429 => {
                    if state.quota_swap_count >= MAX_QUOTA_SWAPS {
                        return Err(DispatchError::ResourceExhausted);
                    }
                    state.quota_swap_count += 1;
                    state.exclude.insert(account.account_id.clone());
                    continue;
                }
                400..=499 => {
                    return Err(DispatchError::InvalidArgument { body: body_text });
                }
                _ => {
                    return Err(DispatchError::Upstream {
                        status,
                        body: body_text,
                    });
                }
            }
        }
    }

    async fn finish_kiro_stream(
        &self,
        response: reqwest::Response,
        user: &User,
        account: &KiroAccount,
        model: &str,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut parser = kiro::ResponseParser::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DispatchError::Network(format!("stream read failed: {}", e)))?;
            for event in parser.feed(&chunk) {
                sink(event);
            }
        }
        let credits = parser.credits().unwrap_or(0.0);
        for event in parser.finish() {
            sink(event);
        }

        // Kiro cost lives on the account's usage counters; the fraction
        // ledger row records the completion itself.
        if credits > 0.0 {
            let mut usage = account.usage.clone();
            usage.current_usage += credits;
            if let Err(e) = self.store.update_kiro_usage(&account.account_id, &usage) {
                tracing::warn!("Failed to update kiro usage for {}: {}", account.account_id, e);
            }
        }
        let consumed = self
            .ledger
            .record_consumption(&user.id, &account.account_id, model, 0.0, 0.0, account.shared)
            .map_err(DispatchError::Store)?;

        Ok(DispatchSummary {
            account_id: account.account_id.clone(),
            consumed,
            response: None,
        })
    }

    // ---- qwen ----

    fn select_qwen(
        &self,
        user: &User,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Result<Option<QwenAccount>, DispatchError> {
        let pool = self
            .store
            .get_available_qwen(&user.id, None)
            .map_err(DispatchError::Store)?;
        let pool = selection::filter_excluded(pool, exclude, |a| a.account_id.as_str());
        let mut available = Vec::new();
        for account in pool {
            if self
                .ledger
                .account_available(&user.id, &account.account_id, model, account.shared)
                .map_err(DispatchError::Store)?
            {
                available.push(account);
            }
        }
        Ok(selection::choose_by_preference(
            available,
            user.prefer_shared,
            |a| a.shared,
        ))
    }

    pub async fn dispatch_qwen(
        &self,
        user: &User,
        model: &str,
        request: &Value,
        stream: bool,
        sink: &mut Sink<'_>,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut state = DispatchState::default();

        loop {
            let Some(account) = self.select_qwen(user, model, &state.exclude)? else {
                return Err(DispatchError::ResourceExhausted);
            };
            let account = match self.tokens.ensure_fresh_qwen(&account.account_id, false).await {
                Ok(account) => account,
                Err(e) => {
                    tracing::warn!("Skipping account {}: {}", account.account_id, e);
                    state.exclude.insert(account.account_id.clone());
                    continue;
                }
            };

            let url = qwen::chat_completions_url(&account);
            let body = qwen::build_request_body(model, stream, request);
            let response = self
                .client
                .post(&url)
                .bearer_auth(&account.access_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| DispatchError::Network(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                if stream {
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk
                            .map_err(|e| DispatchError::Network(format!("stream read failed: {}", e)))?;
                        sink(StreamEvent::Passthrough {
                            chunk: chunk.to_vec(),
                        });
                    }
                    sink(StreamEvent::Finish {
                        reason: "stop".to_string(),
                    });
                    let consumed = self
                        .ledger
                        .record_consumption(&user.id, &account.account_id, model, 0.0, 0.0, account.shared)
                        .map_err(DispatchError::Store)?;
                    return Ok(DispatchSummary {
                        account_id: account.account_id.clone(),
                        consumed,
                        response: None,
                    });
                }
                let value: Value = response
                    .json()
                    .await
                    .map_err(|e| DispatchError::Network(format!("response unparseable: {}", e)))?;
                sink(StreamEvent::Finish {
                    reason: "stop".to_string(),
                });
                let consumed = self
                    .ledger
                    .record_consumption(&user.id, &account.account_id, model, 0.0, 0.0, account.shared)
                    .map_err(DispatchError::Store)?;
                return Ok(DispatchSummary {
                    account_id: account.account_id.clone(),
                    consumed,
                    response: Some(value),
                });
            }

            let status = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            match status {
                401 | 403 => {
                    // A fresh token that still fails auth points at the
                    // account, not the request.
                    self.disable(
                        Provider::Qwen,
                        &account.account_id,
                        &format!("upstream {}", status),
                    );
                    return Err(DispatchError::AccountDisabled {
                        status,
                        body: body_text,
                    });
                }
                429 => {
                    if state.quota_swap_count >= MAX_QUOTA_SWAPS {
                        return Err(DispatchError::ResourceExhausted);
                    }
                    state.quota_swap_count += 1;
                    state.exclude.insert(account.account_id.clone());
                    continue;
                }
                400..=499 => {
                    return Err(DispatchError::InvalidArgument { body: body_text });
                }
                _ => {
                    return Err(DispatchError::Upstream {
                        status,
                        body: body_text,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
