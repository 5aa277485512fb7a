/// Line assembler for Server-Sent-Event bodies. Network chunks split
/// anywhere, including mid-JSON; only `\n`-terminated lines are released so
/// a truncated line is never handed to the JSON parser.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every completed line, without the
    /// terminator. Trailing partial data stays buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            lines.push(line);
        }
        lines
    }

    /// Whatever is still buffered when the body ends. An unterminated final
    /// line is upstream misbehavior; callers log it and move on.
    pub fn remainder(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf)
        }
    }
}

/// Extracts the payload of an SSE data line. Blank lines, comments and
/// `[DONE]` sentinels yield `None`.
pub fn data_payload(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.starts_with("data:") {
        return None;
    }
    let payload = trimmed["data:".len()..].trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}
