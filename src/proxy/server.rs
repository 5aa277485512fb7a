use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{
    AccountStatus, AntigravityAccount, KiroAccount, KiroAuthMethod, KiroUsage, Provider,
    QwenAccount, SharedFlag, SharingPreference, User,
};
use crate::proxy::dispatch::DispatchError;
use crate::proxy::events::StreamEvent;
use crate::proxy::state::{AppState, CoreServices};

pub fn build_router(core: Arc<CoreServices>) -> Router {
    let state = AppState { core };
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/users", post(create_user_handler))
        .route("/api/accounts", get(list_accounts_handler))
        .route("/api/accounts/import", post(import_account_handler))
        .route("/api/accounts/:provider/:id/status", put(set_status_handler))
        .route("/api/accounts/:provider/:id/type", put(set_type_handler))
        .route("/api/quotas/consumption", get(consumption_handler))
        .with_state(state)
}

pub async fn serve(
    core: Arc<CoreServices>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = build_router(core);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("server error: {}", e))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": {"message": message}}))).into_response()
}

fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn authenticate_user(core: &CoreServices, headers: &HeaderMap) -> Result<User, Response> {
    let Some(key) = bearer_key(headers) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "missing API key"));
    };
    match core.store.user_by_api_key(key) {
        Ok(Some(user)) if user.status == AccountStatus::Enabled => Ok(user),
        Ok(Some(_)) => Err(error_response(StatusCode::FORBIDDEN, "user is disabled")),
        Ok(None) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid API key")),
        Err(e) => {
            tracing::error!("User lookup failed: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

fn require_admin(core: &CoreServices, headers: &HeaderMap) -> Result<(), Response> {
    let admin_key = &core.config.admin_key;
    if admin_key.is_empty() {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "admin API is disabled (no admin key configured)",
        ));
    }
    match bearer_key(headers) {
        Some(key) if key == admin_key => Ok(()),
        _ => Err(error_response(StatusCode::FORBIDDEN, "admin key required")),
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    provider: Provider,
    model: String,
    #[serde(default)]
    stream: bool,
    request: Value,
}

fn event_frame(event: &StreamEvent) -> Bytes {
    // Passthrough chunks are raw upstream bytes and must not be re-wrapped.
    if let StreamEvent::Passthrough { chunk } = event {
        return Bytes::from(chunk.clone());
    }
    Bytes::from(format!(
        "data: {}\n\n",
        serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
    ))
}

fn error_frame(error: &DispatchError) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        json!({"type": "error", "kind": error.kind(), "message": error.to_string()})
    ))
}

async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateRequest>,
) -> Response {
    let core = state.core.clone();
    let user = match authenticate_user(&core, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    if body.stream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, Infallible>>();
        tokio::spawn(async move {
            let sender = tx.clone();
            let mut sink = move |event: StreamEvent| {
                let _ = sender.send(Ok(event_frame(&event)));
            };
            let result = match body.provider {
                Provider::Antigravity => {
                    core.engine
                        .dispatch_antigravity(&user, &body.model, &body.request, true, &mut sink)
                        .await
                }
                Provider::Kiro => {
                    core.engine
                        .dispatch_kiro(&user, &body.model, &body.request, &mut sink)
                        .await
                }
                Provider::Qwen => {
                    core.engine
                        .dispatch_qwen(&user, &body.model, &body.request, true, &mut sink)
                        .await
                }
            };
            if let Err(e) = result {
                tracing::warn!("Dispatch failed for user {}: {}", user.id, e);
                let _ = tx.send(Ok(error_frame(&e)));
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        return Response::builder()
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let mut events = Vec::new();
    let mut sink = |event: StreamEvent| events.push(event);
    let result = match body.provider {
        Provider::Antigravity => {
            core.engine
                .dispatch_antigravity(&user, &body.model, &body.request, false, &mut sink)
                .await
        }
        Provider::Kiro => {
            core.engine
                .dispatch_kiro(&user, &body.model, &body.request, &mut sink)
                .await
        }
        Provider::Qwen => {
            core.engine
                .dispatch_qwen(&user, &body.model, &body.request, false, &mut sink)
                .await
        }
    };
    match result {
        Ok(summary) => {
            let payload = summary
                .response
                .unwrap_or_else(|| json!({"events": events}));
            Json(payload).into_response()
        }
        Err(e) => {
            let status = match e {
                DispatchError::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
                DispatchError::ImageTooLarge | DispatchError::InvalidArgument { .. } => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({"error": {"kind": e.kind(), "message": e.to_string()}})),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct CreateUserRequest {
    name: String,
    #[serde(default)]
    prefer_shared: bool,
}

async fn create_user_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserRequest>,
) -> Response {
    if let Err(response) = require_admin(&state.core, &headers) {
        return response;
    }
    let user = User {
        id: Uuid::new_v4().to_string(),
        api_key: format!("sk-{}", Uuid::new_v4().simple()),
        name: body.name,
        prefer_shared: if body.prefer_shared {
            SharingPreference::PreferShared
        } else {
            SharingPreference::PreferDedicated
        },
        status: AccountStatus::Enabled,
    };
    if let Err(e) = state.core.store.insert_user(&user) {
        tracing::error!("Failed to create user: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create user");
    }
    (StatusCode::CREATED, Json(json!({"data": user}))).into_response()
}

async fn list_accounts_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state.core, &headers) {
        return response;
    }
    match state.core.store.list_antigravity() {
        Ok(accounts) => Json(json!({"data": {"antigravity": accounts}})).into_response(),
        Err(e) => {
            tracing::error!("Failed to list accounts: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list accounts")
        }
    }
}

/// Onboarding without the OAuth dance: a refresh token is enough, the first
/// dispatch refreshes it into a usable access token.
#[derive(Deserialize)]
struct ImportAccountRequest {
    provider: Provider,
    user_id: String,
    refresh_token: String,
    #[serde(default)]
    shared: bool,
    email: Option<String>,
    region: Option<String>,
    auth_method: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

async fn import_account_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ImportAccountRequest>,
) -> Response {
    if let Err(response) = require_admin(&state.core, &headers) {
        return response;
    }
    let id = Uuid::new_v4().to_string();
    let shared = if body.shared {
        SharedFlag::Shared
    } else {
        SharedFlag::Dedicated
    };
    let result = match body.provider {
        Provider::Antigravity => state.core.store.insert_antigravity(&AntigravityAccount {
            cookie_id: id.clone(),
            user_id: body.user_id,
            shared,
            status: AccountStatus::Enabled,
            needs_reauth: false,
            access_token: String::new(),
            refresh_token: body.refresh_token,
            expires_at: 0,
            project_id: None,
            is_restricted: false,
            ineligible: false,
            paid_tier: false,
            email: body.email,
        }),
        Provider::Kiro => state.core.store.insert_kiro(&KiroAccount {
            account_id: id.clone(),
            user_id: body.user_id,
            shared,
            status: AccountStatus::Enabled,
            needs_reauth: false,
            auth_method: body
                .auth_method
                .as_deref()
                .map(KiroAuthMethod::parse)
                .unwrap_or(KiroAuthMethod::Social),
            access_token: String::new(),
            refresh_token: body.refresh_token,
            expires_at: 0,
            client_id: body.client_id,
            client_secret: body.client_secret,
            profile_arn: None,
            machine_id: Uuid::new_v4().simple().to_string(),
            region: body.region.unwrap_or_else(|| "us-east-1".to_string()),
            usage: KiroUsage::default(),
        }),
        Provider::Qwen => state.core.store.insert_qwen(&QwenAccount {
            account_id: id.clone(),
            user_id: body.user_id,
            shared,
            status: AccountStatus::Enabled,
            needs_reauth: false,
            access_token: String::new(),
            refresh_token: body.refresh_token,
            expires_at: 0,
            resource_url: None,
        }),
    };
    match result {
        Ok(()) => (StatusCode::CREATED, Json(json!({"data": {"id": id}}))).into_response(),
        Err(e) => {
            tracing::warn!("Account import failed: {}", e);
            error_response(StatusCode::CONFLICT, &format!("import failed: {}", e))
        }
    }
}

#[derive(Deserialize)]
struct SetStatusRequest {
    status: AccountStatus,
}

async fn set_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((provider, id)): Path<(String, String)>,
    Json(body): Json<SetStatusRequest>,
) -> Response {
    if let Err(response) = require_admin(&state.core, &headers) {
        return response;
    }
    let Ok(provider) = provider.parse::<Provider>() else {
        return error_response(StatusCode::BAD_REQUEST, "unknown provider");
    };
    match state.core.store.set_status(provider, &id, body.status) {
        Ok(()) => Json(json!({"data": {"id": id}})).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[derive(Deserialize)]
struct SetTypeRequest {
    shared: bool,
}

async fn set_type_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((provider, id)): Path<(String, String)>,
    Json(body): Json<SetTypeRequest>,
) -> Response {
    if let Err(response) = require_admin(&state.core, &headers) {
        return response;
    }
    let Ok(provider) = provider.parse::<Provider>() else {
        return error_response(StatusCode::BAD_REQUEST, "unknown provider");
    };
    let shared = if body.shared {
        SharedFlag::Shared
    } else {
        SharedFlag::Dedicated
    };
    match state.core.store.set_shared_flag(provider, &id, shared) {
        Ok(()) => Json(json!({"data": {"id": id}})).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

#[derive(Deserialize)]
struct ConsumptionQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn consumption_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConsumptionQuery>,
) -> Response {
    let user = match authenticate_user(&state.core, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state
        .core
        .ledger
        .recent_consumption(&user.id, query.limit.min(500))
    {
        Ok(rows) => {
            let data: Vec<Value> = rows
                .into_iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "account_id": r.account_id,
                        "model": r.model_name,
                        "quota_before": r.quota_before,
                        "quota_after": r.quota_after,
                        "consumed": r.consumed,
                        "shared": r.is_shared,
                        "timestamp": r.created_at,
                    })
                })
                .collect();
            Json(json!({"data": data})).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}
