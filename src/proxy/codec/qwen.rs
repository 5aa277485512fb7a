use serde_json::Value;

use crate::models::QwenAccount;

/// Qwen speaks OpenAI-shaped `chat/completions` natively; the body is
/// forwarded as-is with the model pinned and the stream flag normalized.
pub fn build_request_body(model: &str, stream: bool, request: &Value) -> Value {
    let mut body = request.clone();
    body["model"] = Value::String(model.to_string());
    body["stream"] = Value::Bool(stream);
    body
}

pub fn chat_completions_url(account: &QwenAccount) -> String {
    format!("{}/v1/chat/completions", account.api_base())
}
