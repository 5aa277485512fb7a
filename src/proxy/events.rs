use serde::{Deserialize, Serialize};

/// One tool invocation requested by the model, accumulated over the stream
/// and re-emitted whole at finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, possibly assembled from deltas.
    pub arguments: String,
}

/// Everything a caller can observe from a dispatched request. Closed so the
/// south-side translation layers are forced to handle each shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    Reasoning {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    InlineData {
        mime_type: String,
        /// Base64 payload as delivered by the upstream.
        data: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        arguments: String,
    },
    /// Complete calls collected over the stream, delivered at finish.
    ToolCalls {
        calls: Vec<ToolCall>,
    },
    /// Credits the upstream charged for the completed request (Kiro).
    Usage {
        credits: f64,
    },
    Finish {
        reason: String,
    },
    /// Raw upstream bytes forwarded untranslated (Qwen pass-through).
    Passthrough {
        chunk: Vec<u8>,
    },
}
