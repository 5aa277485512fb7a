use serde_json::{json, Value};

use crate::constants::KIRO_EMPTY_TOOL_DESCRIPTION;
use crate::proxy::codec::kiro_frame::FrameParser;
use crate::proxy::events::{StreamEvent, ToolCall};

/// Assembles the `conversationState` tree for `/generateAssistantResponse`.
/// The caller supplies provider-shaped input: `messages` (role/content,
/// optionally `toolResults`), plus optional `tools` and `system`.
pub fn build_request_body(
    model: &str,
    profile_arn: Option<&str>,
    conversation_id: &str,
    request: &Value,
) -> Value {
    let messages = request
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    let system = request.get("system").and_then(|s| s.as_str());
    let tools = sanitize_tools(request.get("tools"));

    let mut history = Vec::new();
    let mut current_content = String::new();
    let mut current_tool_results = Vec::new();

    for (idx, message) in messages.iter().enumerate() {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let is_last = idx + 1 == messages.len();

        if is_last && role == "user" {
            current_content = content;
            if let Some(results) = message.get("toolResults").and_then(|t| t.as_array()) {
                current_tool_results = results.clone();
            }
            break;
        }

        if role == "assistant" {
            history.push(json!({
                "assistantResponseMessage": {"content": content}
            }));
        } else {
            history.push(json!({
                "userInputMessage": {"content": content, "modelId": model, "origin": "AI_EDITOR"}
            }));
        }
    }

    let mut content = current_content;
    if let Some(system) = system {
        if !system.is_empty() {
            content = format!("{}\n\n{}", system, content);
        }
    }

    let mut context = json!({});
    if !tools.is_empty() {
        context["tools"] = Value::Array(tools);
    }
    if !current_tool_results.is_empty() {
        context["toolResults"] = Value::Array(current_tool_results);
    }

    let mut body = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": conversation_id,
            "currentMessage": {
                "userInputMessage": {
                    "content": content,
                    "modelId": model,
                    "origin": "AI_EDITOR",
                    "userInputMessageContext": context,
                }
            },
            "history": history,
        }
    });
    if let Some(arn) = profile_arn {
        body["profileArn"] = json!(arn);
    }
    body
}

/// Upstream 400s on a blank `toolSpecification.description`; a placeholder
/// is substituted before sending.
fn sanitize_tools(tools: Option<&Value>) -> Vec<Value> {
    let Some(tools) = tools.and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    tools
        .iter()
        .cloned()
        .map(|mut tool| {
            if let Some(spec) = tool.get_mut("toolSpecification") {
                let blank = spec
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.trim().is_empty())
                    .unwrap_or(true);
                if blank {
                    spec["description"] = json!(KIRO_EMPTY_TOOL_DESCRIPTION);
                }
            }
            tool
        })
        .collect()
}

/// Decodes the framed response into caller events. Tool calls arrive as an
/// Anthropic-shaped start (`name` + `toolUseId`) followed by `input` deltas;
/// the legacy `codeQuery` field is normalized into the same shape.
pub struct ResponseParser {
    frames: FrameParser,
    tool_calls: Vec<ToolCall>,
    current_tool: Option<ToolCall>,
    tool_seq: usize,
    credits: Option<f64>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            frames: FrameParser::new(),
            tool_calls: Vec::new(),
            current_tool: None,
            tool_seq: 0,
            credits: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for payload in self.frames.feed(chunk) {
            self.consume_payload(&payload, &mut events);
        }
        events
    }

    pub fn finish(mut self) -> Vec<StreamEvent> {
        if self.frames.pending() > 0 {
            tracing::warn!(
                "Kiro stream ended with {} undecoded bytes",
                self.frames.pending()
            );
        }
        let mut events = Vec::new();
        self.finalize_current_tool();
        if !self.tool_calls.is_empty() {
            events.push(StreamEvent::ToolCalls {
                calls: self.tool_calls,
            });
        }
        if let Some(credits) = self.credits {
            events.push(StreamEvent::Usage { credits });
        }
        events.push(StreamEvent::Finish {
            reason: "end_turn".to_string(),
        });
        events
    }

    pub fn credits(&self) -> Option<f64> {
        self.credits
    }

    fn finalize_current_tool(&mut self) {
        if let Some(call) = self.current_tool.take() {
            self.tool_calls.push(call);
        }
    }

    fn consume_payload(&mut self, payload: &Value, events: &mut Vec<StreamEvent>) {
        // Input deltas can also carry name/toolUseId, so they are matched
        // before tool-call starts.
        if let Some(input) = payload.get("input").and_then(|i| i.as_str()) {
            let id = payload
                .get("toolUseId")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .or_else(|| self.current_tool.as_ref().map(|c| c.id.clone()))
                .unwrap_or_else(|| "call_0".to_string());
            if let Some(current) = self.current_tool.as_mut() {
                current.arguments.push_str(input);
            }
            events.push(StreamEvent::ToolCallDelta {
                id,
                arguments: input.to_string(),
            });
            return;
        }

        if let (Some(name), Some(tool_use_id)) = (
            payload.get("name").and_then(|n| n.as_str()),
            payload.get("toolUseId").and_then(|t| t.as_str()),
        ) {
            self.finalize_current_tool();
            self.current_tool = Some(ToolCall {
                id: tool_use_id.to_string(),
                name: name.to_string(),
                arguments: String::new(),
            });
            events.push(StreamEvent::ToolCallStart {
                id: tool_use_id.to_string(),
                name: name.to_string(),
            });
            return;
        }

        if let Some(code_query) = payload.get("codeQuery") {
            self.finalize_current_tool();
            self.tool_seq += 1;
            let id = format!("call_{}", self.tool_seq);
            self.current_tool = Some(ToolCall {
                id: id.clone(),
                name: "codeQuery".to_string(),
                arguments: code_query.to_string(),
            });
            events.push(StreamEvent::ToolCallStart {
                id: id.clone(),
                name: "codeQuery".to_string(),
            });
            events.push(StreamEvent::ToolCallDelta {
                id,
                arguments: code_query.to_string(),
            });
            return;
        }

        if payload.get("stop").and_then(|s| s.as_bool()).unwrap_or(false) {
            self.finalize_current_tool();
            return;
        }

        if let Some(credits) = payload.get("usage").and_then(|u| u.as_f64()) {
            self.credits = Some(credits);
            return;
        }

        if let Some(content) = payload.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                events.push(StreamEvent::Text {
                    content: content.to_string(),
                });
            }
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(payload: &Value) -> Vec<u8> {
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

    #[test]
    fn text_tool_and_usage_events_flow_through() {
        let mut stream = encode_frame(&json!({"content": "Hi"}));
        stream.extend(encode_frame(&json!({"name": "grep", "toolUseId": "t-1"})));
        stream.extend(encode_frame(&json!({"input": "{\"pattern\":"})));
        stream.extend(encode_frame(&json!({"input": "\"fn main\"}"})));
        stream.extend(encode_frame(&json!({"stop": true})));
        stream.extend(encode_frame(&json!({"usage": 1.5})));

        let mut parser = ResponseParser::new();
        let mut events = parser.feed(&stream);
        events.extend(parser.finish());

        assert_eq!(events[0], StreamEvent::Text { content: "Hi".into() });
        assert_eq!(
            events[1],
            StreamEvent::ToolCallStart { id: "t-1".into(), name: "grep".into() }
        );
        let calls = events.iter().find_map(|e| match e {
            StreamEvent::ToolCalls { calls } => Some(calls.clone()),
            _ => None,
        });
        let calls = calls.expect("accumulated tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, "{\"pattern\":\"fn main\"}");
        assert!(matches!(events.last(), Some(StreamEvent::Finish { .. })));
        assert!(events.contains(&StreamEvent::Usage { credits: 1.5 }));
    }

    #[test]
    fn legacy_code_query_is_normalized_to_a_tool_call() {
        let stream = encode_frame(&json!({"codeQuery": {"query": "find usages"}}));
        let mut parser = ResponseParser::new();
        let mut events = parser.feed(&stream);
        events.extend(parser.finish());

        assert_eq!(
            events[0],
            StreamEvent::ToolCallStart { id: "call_1".into(), name: "codeQuery".into() }
        );
        let calls = events.iter().find_map(|e| match e {
            StreamEvent::ToolCalls { calls } => Some(calls.clone()),
            _ => None,
        });
        assert_eq!(calls.unwrap()[0].arguments, json!({"query": "find usages"}).to_string());
    }

    #[test]
    fn empty_content_frames_are_suppressed() {
        let stream = encode_frame(&json!({"content": ""}));
        let mut parser = ResponseParser::new();
        assert!(parser.feed(&stream).is_empty());
    }

    #[test]
    fn blank_tool_descriptions_get_a_placeholder() {
        let request = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"toolSpecification": {"name": "a", "description": "", "inputSchema": {"json": {}}}},
                {"toolSpecification": {"name": "b", "description": "reads a file", "inputSchema": {"json": {}}}},
                {"toolSpecification": {"name": "c", "inputSchema": {"json": {}}}}
            ]
        });
        let body = build_request_body("claude-sonnet-4-5", None, "conv-1", &request);
        let tools = body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(
            tools[0]["toolSpecification"]["description"],
            KIRO_EMPTY_TOOL_DESCRIPTION
        );
        assert_eq!(tools[1]["toolSpecification"]["description"], "reads a file");
        assert_eq!(
            tools[2]["toolSpecification"]["description"],
            KIRO_EMPTY_TOOL_DESCRIPTION
        );
    }

    #[test]
    fn history_alternates_and_current_message_takes_the_tail() {
        let request = json!({
            "system": "Be terse.",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]
        });
        let body = build_request_body(
            "claude-sonnet-4-5",
            Some("arn:aws:codewhisperer:us-east-1:0:profile/X"),
            "conv-9",
            &request,
        );
        let state = &body["conversationState"];
        assert_eq!(state["history"].as_array().unwrap().len(), 2);
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "Be terse.\n\nthree"
        );
        assert_eq!(body["profileArn"], "arn:aws:codewhisperer:us-east-1:0:profile/X");
        assert_eq!(state["conversationId"], "conv-9");
    }
}
