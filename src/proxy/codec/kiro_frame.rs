use bytes::{Buf, BytesMut};
use serde_json::Value;

// A frame shorter than prelude + trailer cannot exist; anything above 16 MiB
// is treated as stream corruption.
const MIN_FRAME_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// total_len(4) + header_len(4) + prelude crc(4)
const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;

/// Incremental parser for the CodeWhisperer binary event stream:
///
/// ```text
/// | total_len u32BE | header_len u32BE | prelude crc | headers | payload | crc |
/// ```
///
/// The payload spans `12 + header_len .. total_len - 4` and is UTF-8 JSON.
/// Partial frames stay buffered; an implausible length shifts the window
/// forward one byte at a time until a plausible frame header lines up again.
/// The trailing CRC is carried in the bounds but not validated.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a network chunk and drains every complete frame payload.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < PRELUDE_LEN {
                break;
            }
            let total_len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len) {
                // Resync: not a frame boundary.
                self.buf.advance(1);
                continue;
            }
            let header_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if PRELUDE_LEN + header_len + TRAILER_LEN > total_len {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < total_len {
                // Frame not fully received yet.
                break;
            }

            let payload = &self.buf[PRELUDE_LEN + header_len..total_len - TRAILER_LEN];
            match serde_json::from_slice::<Value>(payload) {
                Ok(value) => payloads.push(value),
                Err(e) => {
                    tracing::debug!("Skipping non-JSON event frame payload: {}", e);
                }
            }
            self.buf.advance(total_len);
        }

        payloads
    }

    /// Bytes still buffered after the stream ends (diagnostics only).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_frame(payload: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(payload).unwrap();
        // Synthetic header block standing in for the event-type headers.
        let headers = b":event\x07\x05chunk";
        let total = PRELUDE_LEN + headers.len() + body.len() + TRAILER_LEN;

        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0xAB, 0xCD, 0xEF, 0x01]); // prelude crc, unchecked
        frame.extend_from_slice(headers);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]); // message crc, unchecked
        frame
    }

    #[test]
    fn single_shot_parse_extracts_payloads() {
        let mut stream = make_frame(&json!({"content": "hel"}));
        stream.extend(make_frame(&json!({"content": "lo"})));

        let mut parser = FrameParser::new();
        let payloads = parser.feed(&stream);
        assert_eq!(payloads, vec![json!({"content": "hel"}), json!({"content": "lo"})]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn every_byte_split_yields_the_same_payload_sequence() {
        let mut stream = make_frame(&json!({"content": "first"}));
        stream.extend(make_frame(&json!({"name": "grep", "toolUseId": "t-1"})));
        stream.extend(make_frame(&json!({"usage": 2.5})));

        let mut reference = FrameParser::new();
        let expected = reference.feed(&stream);
        assert_eq!(expected.len(), 3);

        for step in 1..=stream.len() {
            let mut parser = FrameParser::new();
            let mut payloads = Vec::new();
            for chunk in stream.chunks(step) {
                payloads.extend(parser.feed(chunk));
            }
            assert_eq!(payloads, expected, "split width {}", step);
        }
    }

    #[test]
    fn malformed_prefix_between_frames_is_resynced_past() {
        let mut stream = make_frame(&json!({"content": "a"}));
        // Garbage that decodes to an implausible total_len.
        stream.extend_from_slice(&[0xFF, 0xFF, 0x00, 0x01]);
        stream.extend(make_frame(&json!({"content": "b"})));

        let mut parser = FrameParser::new();
        let payloads = parser.feed(&stream);
        assert_eq!(payloads, vec![json!({"content": "a"}), json!({"content": "b"})]);
    }

    #[test]
    fn partial_frame_is_held_until_completed() {
        let frame = make_frame(&json!({"content": "deferred"}));
        let (head, tail) = frame.split_at(frame.len() - 5);

        let mut parser = FrameParser::new();
        assert!(parser.feed(head).is_empty());
        assert!(parser.pending() > 0);
        let payloads = parser.feed(tail);
        assert_eq!(payloads, vec![json!({"content": "deferred"})]);
    }

    #[test]
    fn header_length_exceeding_frame_forces_resync() {
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&20u32.to_be_bytes()); // plausible total
        bogus.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]); // impossible header_len
        bogus.extend(make_frame(&json!({"content": "ok"})));

        let mut parser = FrameParser::new();
        let payloads = parser.feed(&bogus);
        assert_eq!(payloads, vec![json!({"content": "ok"})]);
    }
}
