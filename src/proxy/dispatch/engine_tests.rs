use super::*;
use crate::models::{AccountStatus, SharedFlag};
use crate::modules::persistence::QuotaLedgerDb;
use crate::proxy::token::TokenEndpoints;
use crate::test_utils::{
    antigravity_fixture, kiro_fixture, qwen_fixture, temp_db, user_fixture,
};
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::net::TcpListener;

fn sse_success_body() -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "data: {}\n\n",
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
            {"text": "Considering...", "thought": true}
        ]}}]}})
    ));
    body.push_str(&format!(
        "data: {}\n\n",
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
            {"text": "Hello world"}
        ]}, "finishReason": "STOP"}]}})
    ));
    body.push_str("data: [DONE]\n\n");
    body
}

/// Scripted upstream: per-bearer-token queues of failure responses; once a
/// queue drains the server answers with a successful SSE stream.
#[derive(Clone)]
struct UpstreamState {
    script: Arc<Mutex<HashMap<String, VecDeque<(u16, String)>>>>,
    models_fraction: Arc<Mutex<f64>>,
    load_hits: Arc<AtomicUsize>,
    generate_hits: Arc<AtomicUsize>,
    minted_project: Arc<String>,
}

impl UpstreamState {
    fn new(minted_project: &str) -> Self {
        Self {
            script: Arc::new(Mutex::new(HashMap::new())),
            models_fraction: Arc::new(Mutex::new(1.0)),
            load_hits: Arc::new(AtomicUsize::new(0)),
            generate_hits: Arc::new(AtomicUsize::new(0)),
            minted_project: Arc::new(minted_project.to_string()),
        }
    }

    fn script_for(&self, token: &str, responses: &[(u16, &str)]) {
        self.script.lock().unwrap().insert(
            token.to_string(),
            responses
                .iter()
                .map(|(s, b)| (*s, b.to_string()))
                .collect(),
        );
    }

    fn set_fraction(&self, fraction: f64) {
        *self.models_fraction.lock().unwrap() = fraction;
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn generate_handler(State(state): State<UpstreamState>, headers: HeaderMap) -> Response {
    state.generate_hits.fetch_add(1, Ordering::SeqCst);
    let token = bearer(&headers);
    let scripted = state.script.lock().unwrap().get_mut(&token).and_then(|q| q.pop_front());
    if let Some((status, body)) = scripted {
        return Response::builder()
            .status(status)
            .body(Body::from(body))
            .unwrap();
    }
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .body(Body::from(sse_success_body()))
        .unwrap()
}

async fn models_handler(State(state): State<UpstreamState>) -> Json<serde_json::Value> {
    let fraction = *state.models_fraction.lock().unwrap();
    Json(json!({"models": [
        {"model": "gemini-2.5-pro", "remainingFraction": fraction},
        {"model": "gemini-2.5-flash", "remainingFraction": fraction},
        {"model": "gemini-3-pro-preview", "remainingFraction": fraction},
    ]}))
}

async fn load_handler(State(state): State<UpstreamState>) -> Json<serde_json::Value> {
    state.load_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({"cloudaicompanionProject": state.minted_project.as_str()}))
}

async fn onboard_handler(State(state): State<UpstreamState>) -> Json<serde_json::Value> {
    Json(json!({
        "done": true,
        "response": {"cloudaicompanionProject": {"id": state.minted_project.as_str()}}
    }))
}

// matchit (axum's router) treats a bare `:` anywhere in a path segment as the
// start of a param capture, so registering literal `/v1internal:xxx` routes
// side-by-side conflicts. Dispatch on the raw path via a single fallback
// instead of registering each literal route.
async fn upstream_fallback(
    State(state): State<UpstreamState>,
    req: axum::extract::Request,
) -> Response {
    let path = req.uri().path().to_string();
    if path.ends_with(":streamGenerateContent") || path.ends_with(":generateContent") {
        let headers = req.headers().clone();
        return generate_handler(State(state), headers).await;
    }
    if path.ends_with(":fetchAvailableModels") {
        return models_handler(State(state)).await.into_response();
    }
    if path.ends_with(":loadCodeAssist") {
        return load_handler(State(state)).await.into_response();
    }
    if path.ends_with(":onboardUser") {
        return onboard_handler(State(state)).await.into_response();
    }
    Response::builder()
        .status(404)
        .body(Body::empty())
        .unwrap()
}

async fn start_upstream(state: UpstreamState) -> String {
    let app = Router::new()
        .fallback(post(upstream_fallback))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    format!("http://{}/v1internal", addr)
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<AccountStore>,
    ledger_db: QuotaLedgerDb,
    engine: DispatchEngine,
}

async fn build_harness(endpoint_urls: Vec<String>, token_url: Option<String>) -> Harness {
    let (dir, path) = temp_db();
    let store = Arc::new(AccountStore::new(path.clone()));
    let ledger_db = QuotaLedgerDb::new(path);
    let ledger = Arc::new(QuotaLedger::new(ledger_db.clone()));
    let mut endpoints_cfg = TokenEndpoints::default();
    if let Some(url) = token_url {
        endpoints_cfg.antigravity_token_url = url;
    }
    let tokens = Arc::new(TokenManager::new(store.clone(), endpoints_cfg));
    let engine = DispatchEngine::new(
        store.clone(),
        ledger,
        tokens,
        EndpointTable::from_base_urls(&endpoint_urls),
        Arc::new(AppConfig::new()),
    );
    Harness {
        _dir: dir,
        store,
        ledger_db,
        engine,
    }
}

async fn run_antigravity(
    harness: &Harness,
    user: &User,
    model: &str,
    stream: bool,
) -> (Result<DispatchSummary, DispatchError>, Vec<StreamEvent>) {
    let mut events = Vec::new();
    let mut sink = |event: StreamEvent| events.push(event);
    let result = harness
        .engine
        .dispatch_antigravity(user, model, &json!({"contents": []}), stream, &mut sink)
        .await;
    (result, events)
}

#[tokio::test]
async fn happy_path_dedicated_account_streams_and_records_consumption() {
    let upstream = UpstreamState::new("minted");
    upstream.set_fraction(0.78);
    let base = start_upstream(upstream.clone()).await;
    let harness = build_harness(vec![base], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();
    harness
        .ledger_db
        .upsert_quotas("acc-a", &[("gemini-2.5-pro".to_string(), 0.8, None, true)])
        .unwrap();

    let (result, events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    let summary = result.expect("dispatch succeeds");

    assert_eq!(summary.account_id, "acc-a");
    assert!(events.contains(&StreamEvent::Reasoning {
        content: "Considering...".into(),
        signature: None
    }));
    assert!(events.contains(&StreamEvent::Text { content: "Hello world".into() }));
    assert!(matches!(events.last(), Some(StreamEvent::Finish { .. })));

    let rows = harness.ledger_db.recent_consumption("u-1", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].account_id, "acc-a");
    assert!((rows[0].quota_before - 0.8).abs() < 1e-9);
    assert!((rows[0].quota_after - 0.78).abs() < 1e-9);
    assert!((rows[0].consumed - 0.02).abs() < 1e-9);
    assert!(!rows[0].is_shared);
}

#[tokio::test]
async fn rate_limit_walks_endpoints_then_swaps_to_another_account() {
    let e0 = UpstreamState::new("minted");
    let e1 = UpstreamState::new("minted");
    // Account A is throttled on both endpoints; B sails through on E0.
    e0.script_for("access-acc-a", &[(429, "RESOURCE_EXHAUSTED")]);
    e1.script_for("access-acc-a", &[(429, "RESOURCE_EXHAUSTED")]);
    let base0 = start_upstream(e0.clone()).await;
    let base1 = start_upstream(e1.clone()).await;
    let harness = build_harness(vec![base0, base1], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    // prefer-dedicated guarantees A is tried before the shared B.
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-b", "u-1", SharedFlag::Shared))
        .unwrap();

    let (result, events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    let summary = result.expect("dispatch succeeds on account B");

    assert_eq!(summary.account_id, "acc-b");
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { .. })));

    // A was rate-limited, not broken: it must stay enabled.
    let account_a = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account_a.status, AccountStatus::Enabled);

    let rows = harness.ledger_db.recent_consumption("u-1", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].account_id, "acc-b");
}

#[tokio::test]
async fn invalid_grant_on_refresh_disables_account_and_dispatch_moves_on() {
    let upstream = UpstreamState::new("minted");
    let base = start_upstream(upstream.clone()).await;

    // Token endpoint rejects A's refresh token with invalid_grant.
    let token_app = Router::new().route(
        "/token",
        post(|body: String| async move {
            if body.contains("refresh-acc-a") {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_grant"})),
                )
            } else {
                (
                    axum::http::StatusCode::OK,
                    Json(json!({"access_token": "renewed", "expires_in": 3600})),
                )
            }
        }),
    );
    let token_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let token_url = format!("http://{}/token", token_listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(token_listener, token_app).await.unwrap();
    });

    let harness = build_harness(vec![base], Some(token_url)).await;
    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();

    let mut account_a = antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated);
    account_a.expires_at = chrono::Utc::now().timestamp_millis() - 1;
    harness.store.insert_antigravity(&account_a).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-b", "u-1", SharedFlag::Shared))
        .unwrap();

    let (result, events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    let summary = result.expect("request succeeds via account B");

    assert_eq!(summary.account_id, "acc-b");
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { .. })));
    let account_a = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account_a.status, AccountStatus::Disabled);
}

#[tokio::test]
async fn permission_denied_on_every_endpoint_keeps_the_account_enabled() {
    let e0 = UpstreamState::new("minted");
    let e1 = UpstreamState::new("minted");
    let e2 = UpstreamState::new("minted");
    for upstream in [&e0, &e1, &e2] {
        upstream.script_for(
            "access-acc-a",
            &[(403, "{\"error\":{\"status\":\"PERMISSION_DENIED\"}}")],
        );
    }
    let bases = vec![
        start_upstream(e0).await,
        start_upstream(e1).await,
        start_upstream(e2).await,
    ];
    let harness = build_harness(bases, None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let (result, _events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    assert_eq!(
        result.unwrap_err(),
        DispatchError::AllEndpoints403 { permission_denied: true }
    );

    let account = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Enabled);
    assert!(harness.ledger_db.recent_consumption("u-1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn generic_403_on_every_endpoint_disables_the_account() {
    let e0 = UpstreamState::new("minted");
    let e1 = UpstreamState::new("minted");
    for upstream in [&e0, &e1] {
        upstream.script_for("access-acc-a", &[(403, "account flagged for abuse")]);
    }
    let bases = vec![start_upstream(e0).await, start_upstream(e1).await];
    let harness = build_harness(bases, None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let (result, _events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    assert_eq!(
        result.unwrap_err(),
        DispatchError::AllEndpoints403 { permission_denied: false }
    );

    let account = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Disabled);
}

#[tokio::test]
async fn stale_project_id_is_reminted_once_then_request_succeeds() {
    let upstream = UpstreamState::new("companion-fresh");
    upstream.script_for(
        "access-acc-a",
        &[(400, "{\"error\":{\"status\":\"RESOURCE_PROJECT_INVALID\"}}")],
    );
    let base = start_upstream(upstream.clone()).await;
    let harness = build_harness(vec![base], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let (result, events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    let summary = result.expect("request succeeds after re-mint");

    assert_eq!(summary.account_id, "acc-a");
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { .. })));
    assert_eq!(upstream.load_hits.load(Ordering::SeqCst), 1);

    let account = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account.project_id.as_deref(), Some("companion-fresh"));
    assert_eq!(harness.ledger_db.recent_consumption("u-1", 10).unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_account_swaps_are_bounded() {
    let upstream = UpstreamState::new("minted");
    let base = start_upstream(upstream.clone()).await;
    let harness = build_harness(vec![base], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    for i in 0..7 {
        let id = format!("acc-{}", i);
        harness
            .store
            .insert_antigravity(&antigravity_fixture(&id, "u-1", SharedFlag::Dedicated))
            .unwrap();
        upstream.script_for(&format!("access-{}", id), &[(429, "RESOURCE_EXHAUSTED")]);
    }

    let (result, _events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    assert_eq!(result.unwrap_err(), DispatchError::ResourceExhausted);
    // Five swaps allowed: the initial account plus five more were tried.
    assert_eq!(upstream.generate_hits.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn oversized_image_is_terminal_without_touching_the_account() {
    let upstream = UpstreamState::new("minted");
    upstream.script_for(
        "access-acc-a",
        &[(400, "request image exceeds 5 MB maximum allowed size")],
    );
    let base = start_upstream(upstream).await;
    let harness = build_harness(vec![base], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let (result, _events) = run_antigravity(&harness, &user, "gemini-2.5-pro", true).await;
    assert_eq!(result.unwrap_err(), DispatchError::ImageTooLarge);

    let account = harness.store.get_antigravity("acc-a").unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Enabled);
    assert!(harness.ledger_db.recent_consumption("u-1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn non_streaming_callers_on_forced_sse_models_get_an_aggregated_body() {
    let upstream = UpstreamState::new("minted");
    let base = start_upstream(upstream).await;
    let harness = build_harness(vec![base], None).await;

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_antigravity(&antigravity_fixture("acc-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    // gemini-3-pro* must take the SSE path even for non-streaming callers.
    let (result, events) = run_antigravity(&harness, &user, "gemini-3-pro-preview", false).await;
    let summary = result.expect("dispatch succeeds");

    let response = summary.response.expect("aggregated response");
    let parts = response["candidates"][0]["content"]["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["thought"], true);
    assert_eq!(parts[1]["text"], "Hello world");
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Text { .. })));
}

// ---- kiro ----

fn kiro_frame(payload: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(payload).unwrap();
    let headers = b":event\x07\x05chunk";
    let total = 12 + headers.len() + body.len() + 4;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(headers);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&[0; 4]);
    frame
}

#[derive(Clone)]
struct KiroUpstreamState {
    status: Arc<Mutex<u16>>,
}

async fn kiro_handler(State(state): State<KiroUpstreamState>) -> Response {
    let status = *state.status.lock().unwrap();
    if status != 200 {
        return Response::builder()
            .status(status)
            .body(Body::from("denied"))
            .unwrap();
    }
    let mut body = kiro_frame(&json!({"content": "Hi from Kiro"}));
    body.extend(kiro_frame(&json!({"usage": 1.25})));
    Response::builder()
        .status(200)
        .header("Content-Type", "application/vnd.amazon.eventstream")
        .body(Body::from(body))
        .unwrap()
}

async fn start_kiro_upstream(status: u16) -> String {
    let state = KiroUpstreamState {
        status: Arc::new(Mutex::new(status)),
    };
    let app = Router::new()
        .route("/generateAssistantResponse", post(kiro_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn kiro_stream_updates_usage_counters_and_logs_the_request() {
    let kiro_base = start_kiro_upstream(200).await;
    let harness = build_harness(vec!["http://127.0.0.1:1/v1internal".to_string()], None).await;
    let engine = DispatchEngine::new(
        harness.store.clone(),
        Arc::new(QuotaLedger::new(harness.ledger_db.clone())),
        Arc::new(TokenManager::new(harness.store.clone(), TokenEndpoints::default())),
        EndpointTable::from_base_urls(&["http://127.0.0.1:1/v1internal"]),
        Arc::new(AppConfig::new()),
    )
    .with_kiro_api_base(kiro_base);

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_kiro(&kiro_fixture("kiro-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let mut events = Vec::new();
    let mut sink = |event: StreamEvent| events.push(event);
    let request = json!({"messages": [{"role": "user", "content": "hello"}]});
    let summary = engine
        .dispatch_kiro(&user, "claude-sonnet-4-5", &request, &mut sink)
        .await
        .expect("kiro dispatch succeeds");

    assert_eq!(summary.account_id, "kiro-a");
    assert!(events.contains(&StreamEvent::Text { content: "Hi from Kiro".into() }));
    assert!(events.contains(&StreamEvent::Usage { credits: 1.25 }));

    let account = harness.store.get_kiro("kiro-a").unwrap().unwrap();
    assert!((account.usage.current_usage - 1.25).abs() < 1e-9);
    assert_eq!(harness.ledger_db.recent_consumption("u-1", 10).unwrap().len(), 1);
}

#[tokio::test]
async fn kiro_403_disables_the_account_and_fails() {
    let kiro_base = start_kiro_upstream(403).await;
    let harness = build_harness(vec!["http://127.0.0.1:1/v1internal".to_string()], None).await;
    let engine = DispatchEngine::new(
        harness.store.clone(),
        Arc::new(QuotaLedger::new(harness.ledger_db.clone())),
        Arc::new(TokenManager::new(harness.store.clone(), TokenEndpoints::default())),
        EndpointTable::from_base_urls(&["http://127.0.0.1:1/v1internal"]),
        Arc::new(AppConfig::new()),
    )
    .with_kiro_api_base(kiro_base);

    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    harness
        .store
        .insert_kiro(&kiro_fixture("kiro-a", "u-1", SharedFlag::Dedicated))
        .unwrap();

    let mut sink = |_event: StreamEvent| {};
    let request = json!({"messages": [{"role": "user", "content": "hello"}]});
    let err = engine
        .dispatch_kiro(&user, "claude-sonnet-4-5", &request, &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AccountDisabled { status: 403, .. }));

    let account = harness.store.get_kiro("kiro-a").unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Disabled);
}

// ---- qwen ----

#[tokio::test]
async fn qwen_non_streaming_request_is_forwarded_and_returned() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["model"], "qwen3-coder-plus");
            Json(json!({
                "id": "chatcmpl-1",
                "choices": [{"message": {"role": "assistant", "content": "hi"}}]
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let harness = build_harness(vec!["http://127.0.0.1:1/v1internal".to_string()], None).await;
    let user = user_fixture("u-1");
    harness.store.insert_user(&user).unwrap();
    let mut account = qwen_fixture("qwen-a", "u-1", SharedFlag::Dedicated);
    account.resource_url = Some(format!("http://{}", addr));
    harness.store.insert_qwen(&account).unwrap();

    let mut events = Vec::new();
    let mut sink = |event: StreamEvent| events.push(event);
    let request = json!({"messages": [{"role": "user", "content": "hello"}]});
    let summary = harness
        .engine
        .dispatch_qwen(&user, "qwen3-coder-plus", &request, false, &mut sink)
        .await
        .expect("qwen dispatch succeeds");

    assert_eq!(summary.account_id, "qwen-a");
    let response = summary.response.expect("forwarded body");
    assert_eq!(response["choices"][0]["message"]["content"], "hi");
    assert!(matches!(events.last(), Some(StreamEvent::Finish { .. })));
}
