//! Server-Sent Events framing, both directions.
//!
//! Ingress (`SseFramer`) parses an arbitrary byte stream from an upstream
//! provider into `data:` events and dispatches them to caller callbacks.
//! Egress (`encode_chunk` / `encode_done` / `encode_error`) serializes
//! content chunks back into the same wire format for the gateway's own
//! `/v1/chat/completions?stream=true` response.
//!
//! The framer is newline-delimited and tolerant: comment lines, unknown
//! fields, and malformed JSON payloads are dropped without interrupting
//! the rest of the stream. Bytes arriving split across `feed()` calls,
//! whether mid-line or mid-event, are buffered and never emitted early.

use serde_json::Value;

/// Callback sink for parsed SSE events. A single object implementing this
/// trait replaces the three separate `on_chunk`/`on_done`/`on_error`
/// closures from the source protocol, since Rust callers usually already
/// have one struct that wants all three notifications.
pub trait SseSink {
    fn on_chunk(&mut self, content: &str);
    fn on_done(&mut self);
    fn on_error(&mut self, message: &str);
}

/// Line-buffering SSE parser. Owns only the unterminated tail of the byte
/// stream and the `data:` lines accumulated for the event currently being
/// assembled.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: String,
    pending_data: Vec<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the wire. Complete lines are consumed; any
    /// trailing partial line remains buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8], sink: &mut dyn SseSink) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        loop {
            let Some(newline_pos) = self.buffer.find('\n') else {
                break;
            };
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_pos);
            self.handle_line(&line, sink);
        }
    }

    /// Flush at end-of-stream. A trailing `data:` line with no terminating
    /// blank line still counts as a complete event.
    pub fn finish(&mut self, sink: &mut dyn SseSink) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line, sink);
        }
        self.dispatch_event(sink);
    }

    fn handle_line(&mut self, line: &str, sink: &mut dyn SseSink) {
        if line.is_empty() {
            // Blank line terminates the current event.
            self.dispatch_event(sink);
            return;
        }
        if line.starts_with(':') {
            // Comment line, commonly a keepalive ping. Ignored.
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.pending_data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            return;
        }
        if line.starts_with("event:") {
            // Event-type field is accepted but not acted on.
            return;
        }
        // Any other field (id:, retry:, or an unrecognized one) is ignored.
    }

    fn dispatch_event(&mut self, sink: &mut dyn SseSink) {
        if self.pending_data.is_empty() {
            return;
        }
        let payload = self.pending_data.join("\n");
        self.pending_data.clear();

        if payload == "[DONE]" {
            sink.on_done();
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(&payload) else {
            // Malformed JSON is silently dropped; parsing continues.
            return;
        };

        if let Some(error) = value.get("error") {
            if !error.is_null() {
                let message = match error {
                    Value::String(s) => s.clone(),
                    Value::Object(_) => error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("upstream error")
                        .to_string(),
                    other => other.to_string(),
                };
                if !message.is_empty() {
                    sink.on_error(&message);
                    return;
                }
            }
        }

        let content = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str);

        if let Some(content) = content {
            if !content.is_empty() {
                sink.on_chunk(content);
            }
        }
        // Empty choices, absent delta, finish_reason-only, or tool-call-only
        // payloads fall through here and are silently ignored.
    }
}

/// Serialize one content chunk as an egress SSE event.
pub fn encode_chunk(content: &str) -> String {
    let body = serde_json::json!({
        "choices": [{ "delta": { "content": content } }]
    });
    format!("data: {body}\n\n")
}

/// Serialize the end-of-stream sentinel.
pub fn encode_done() -> &'static str {
    "data: [DONE]\n\n"
}

/// Serialize a mid-stream error event.
pub fn encode_error(message: &str) -> String {
    let body = serde_json::json!({ "error": { "message": message } });
    format!("data: {body}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        chunks: Vec<String>,
        done: bool,
        errors: Vec<String>,
    }

    impl SseSink for Recorder {
        fn on_chunk(&mut self, content: &str) {
            self.chunks.push(content.to_string());
        }
        fn on_done(&mut self) {
            self.done = true;
        }
        fn on_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    fn chunk_event(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        )
    }

    #[test]
    fn parses_whole_stream_in_one_feed() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        let stream = format!("{}{}data: [DONE]\n\n", chunk_event("Hel"), chunk_event("lo"));
        framer.feed(stream.as_bytes(), &mut rec);
        assert_eq!(rec.chunks, vec!["Hel", "lo"]);
        assert!(rec.done);
    }

    #[test]
    fn splitting_across_feed_calls_is_equivalent_to_one_feed() {
        let stream = format!("{}{}data: [DONE]\n\n", chunk_event("Hel"), chunk_event("lo"));
        let bytes = stream.as_bytes();

        for split in 0..=bytes.len() {
            let mut framer = SseFramer::new();
            let mut rec = Recorder::default();
            framer.feed(&bytes[..split], &mut rec);
            framer.feed(&bytes[split..], &mut rec);
            framer.finish(&mut rec);
            assert_eq!(rec.chunks, vec!["Hel", "lo"], "failed at split {split}");
            assert!(rec.done, "failed at split {split}");
        }
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b": keepalive\n\n", &mut rec);
        assert!(rec.chunks.is_empty());
        assert!(!rec.done);
    }

    #[test]
    fn event_field_is_ignored_but_data_still_parsed() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        let payload = format!("event: message\n{}", chunk_event("hi"));
        framer.feed(payload.as_bytes(), &mut rec);
        assert_eq!(rec.chunks, vec!["hi"]);
    }

    #[test]
    fn multiple_data_lines_in_one_event_are_concatenated() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b"data: {\"choices\":[{\"delta\":\n", &mut rec);
        framer.feed(b"data: {\"content\":\"joined\"}}]}\n\n", &mut rec);
        assert_eq!(rec.chunks, vec!["joined"]);
    }

    #[test]
    fn error_object_emits_on_error_and_keeps_stream_open() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b"data: {\"error\":{\"message\":\"boom\"}}\n\n", &mut rec);
        framer.feed(chunk_event("still here").as_bytes(), &mut rec);
        assert_eq!(rec.errors, vec!["boom"]);
        assert_eq!(rec.chunks, vec!["still here"]);
    }

    #[test]
    fn malformed_json_is_dropped_and_parsing_continues() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b"data: {not json}\n\n", &mut rec);
        framer.feed(chunk_event("ok").as_bytes(), &mut rec);
        assert_eq!(rec.chunks, vec!["ok"]);
    }

    #[test]
    fn empty_choices_array_emits_nothing() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b"data: {\"choices\":[]}\n\n", &mut rec);
        assert!(rec.chunks.is_empty());
        assert!(rec.errors.is_empty());
    }

    #[test]
    fn finish_without_done_still_flushes_trailing_data() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}", &mut rec);
        framer.finish(&mut rec);
        assert_eq!(rec.chunks, vec!["tail"]);
        assert!(!rec.done);
    }

    #[test]
    fn egress_round_trips_through_ingress() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        let wire = format!("{}{}", encode_chunk("abc"), encode_done());
        framer.feed(wire.as_bytes(), &mut rec);
        assert_eq!(rec.chunks, vec!["abc"]);
        assert!(rec.done);
    }

    #[test]
    fn egress_error_round_trips_through_ingress() {
        let mut framer = SseFramer::new();
        let mut rec = Recorder::default();
        framer.feed(encode_error("oops").as_bytes(), &mut rec);
        assert_eq!(rec.errors, vec!["oops"]);
    }
}
