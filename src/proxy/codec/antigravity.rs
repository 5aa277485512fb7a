use serde_json::{json, Value};

use crate::proxy::codec::sse::{data_payload, SseLineBuffer};
use crate::proxy::events::{StreamEvent, ToolCall};

/// Wraps a caller payload into the v1internal envelope. The `project` field
/// is mandatory upstream; dispatch guarantees it is minted beforehand.
pub fn build_request_body(model: &str, project_id: &str, request: &Value) -> Value {
    json!({
        "model": model,
        "project": project_id,
        "request": request,
    })
}

/// Incremental parser for the SSE stream of `streamGenerateContent?alt=sse`.
/// Each `data:` line carries `{response:{candidates:[{content:{parts},
/// finishReason}]}}`. Lines are only consumed once `\n`-terminated, so
/// arbitrary chunk splits (including mid-JSON) are safe.
pub struct StreamParser {
    lines: SseLineBuffer,
    finish_reason: Option<String>,
    tool_calls: Vec<ToolCall>,
    tool_seq: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            lines: SseLineBuffer::new(),
            finish_reason: None,
            tool_calls: Vec::new(),
            tool_seq: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            let value: Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Discarding unparseable SSE data line: {}", e);
                    continue;
                }
            };
            self.consume_envelope(&value, &mut events);
        }
        events
    }

    /// Flushes accumulated tool calls and the terminal finish reason once
    /// the body ends.
    pub fn finish(self) -> Vec<StreamEvent> {
        if let Some(tail) = self.lines.remainder() {
            tracing::warn!("Upstream stream ended mid-line ({} bytes dropped)", tail.len());
        }
        let mut events = Vec::new();
        if !self.tool_calls.is_empty() {
            events.push(StreamEvent::ToolCalls {
                calls: self.tool_calls,
            });
        }
        events.push(StreamEvent::Finish {
            reason: self.finish_reason.unwrap_or_else(|| "STOP".to_string()),
        });
        events
    }

    fn consume_envelope(&mut self, value: &Value, events: &mut Vec<StreamEvent>) {
        let response = value.get("response").unwrap_or(value);
        let Some(candidates) = response.get("candidates").and_then(|c| c.as_array()) else {
            return;
        };
        for candidate in candidates {
            if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
            let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            else {
                continue;
            };
            for part in parts {
                self.consume_part(part, events);
            }
        }
    }

    fn consume_part(&mut self, part: &Value, events: &mut Vec<StreamEvent>) {
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = call
                .get("args")
                .map(|a| a.to_string())
                .unwrap_or_else(|| "{}".to_string());
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    self.tool_seq += 1;
                    format!("call_{}", self.tool_seq)
                });
            events.push(StreamEvent::ToolCallStart {
                id: id.clone(),
                name: name.clone(),
            });
            events.push(StreamEvent::ToolCallDelta {
                id: id.clone(),
                arguments: arguments.clone(),
            });
            self.tool_calls.push(ToolCall { id, name, arguments });
            return;
        }

        if let Some(inline) = part.get("inlineData") {
            let mime_type = inline
                .get("mimeType")
                .and_then(|m| m.as_str())
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = inline
                .get("data")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string();
            events.push(StreamEvent::InlineData { mime_type, data });
            return;
        }

        let is_thought = part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false);
        let text = part.get("text").and_then(|t| t.as_str()).unwrap_or_default();
        if is_thought {
            // Signature must survive into multi-turn tool calls.
            let signature = part
                .get("thoughtSignature")
                .and_then(|s| s.as_str())
                .map(str::to_string);
            events.push(StreamEvent::Reasoning {
                content: text.to_string(),
                signature,
            });
        } else if !text.is_empty() {
            events.push(StreamEvent::Text {
                content: text.to_string(),
            });
        }
        // Empty non-thought text parts are suppressed.
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a unary `generateContent` body into the same event sequence a
/// stream would have produced, so callers handle one shape.
pub fn parse_unary_response(value: &Value) -> Vec<StreamEvent> {
    let mut parser = StreamParser::new();
    let mut events = Vec::new();
    parser.consume_envelope(value, &mut events);
    events.extend(parser.finish());
    events
}

#[derive(PartialEq, Clone, Copy)]
enum RunKind {
    Text,
    Thought,
}

/// Re-aggregates a locally consumed SSE stream into the unary
/// `generateContent` response shape. Consecutive text parts collapse into
/// one, as do consecutive thought parts; a function call or inline image
/// ends the current run.
pub struct NonStreamAggregator {
    parts: Vec<Value>,
    run: String,
    run_kind: Option<RunKind>,
    run_signature: Option<String>,
    finish_reason: String,
}

impl NonStreamAggregator {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            run: String::new(),
            run_kind: None,
            run_signature: None,
            finish_reason: "STOP".to_string(),
        }
    }

    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text { content } => self.extend_run(RunKind::Text, content, None),
            StreamEvent::Reasoning { content, signature } => {
                self.extend_run(RunKind::Thought, content, signature.as_deref())
            }
            StreamEvent::InlineData { mime_type, data } => {
                self.flush_run();
                self.parts.push(json!({
                    "inlineData": {"mimeType": mime_type, "data": data}
                }));
            }
            StreamEvent::ToolCalls { calls } => {
                self.flush_run();
                for call in calls {
                    let args: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    self.parts.push(json!({
                        "functionCall": {"id": call.id, "name": call.name, "args": args}
                    }));
                }
            }
            StreamEvent::Finish { reason } => {
                self.flush_run();
                self.finish_reason = reason.clone();
            }
            // Per-call deltas are already covered by the ToolCalls summary.
            StreamEvent::ToolCallStart { .. }
            | StreamEvent::ToolCallDelta { .. }
            | StreamEvent::Usage { .. }
            | StreamEvent::Passthrough { .. } => {}
        }
    }

    fn extend_run(&mut self, kind: RunKind, content: &str, signature: Option<&str>) {
        if self.run_kind.map_or(false, |k| k != kind) {
            self.flush_run();
        }
        self.run_kind = Some(kind);
        self.run.push_str(content);
        if let Some(sig) = signature {
            self.run_signature = Some(sig.to_string());
        }
    }

    fn flush_run(&mut self) {
        let Some(kind) = self.run_kind.take() else {
            return;
        };
        let content = std::mem::take(&mut self.run);
        let signature = self.run_signature.take();
        if content.is_empty() && signature.is_none() {
            return;
        }
        let mut part = json!({"text": content});
        if kind == RunKind::Thought {
            part["thought"] = json!(true);
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
        }
        self.parts.push(part);
    }

    pub fn into_response(mut self) -> Value {
        self.flush_run();
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": self.parts},
                "finishReason": self.finish_reason,
            }]
        })
    }
}

impl Default for NonStreamAggregator {
    fn default() -> Self {
        Self::new()
    }
}
