//! SSE event parsing and token usage accumulation.
//!
//! Anthropic-style message streams are newline-framed: lines grouped into
//! events separated by blank lines, each event carrying an optional
//! `event: <name>` line and one or more `data: <payload>` lines with JSON
//! payloads. [`SseParser`] is a line-oriented state machine over that
//! framing. It watches exactly two event types:
//!
//! - `message_start` — extracts the model name and the initial usage block
//!   (input and cache token counts; output is usually still zero).
//! - `message_delta` — carries the final usage block. Counts present in the
//!   payload **overwrite** earlier values; nothing is summed.
//!
//! Everything else passes through unobserved.
//!
//! The accumulator is updated after every fully parsed event, so whatever
//! was extracted before a stream dies stays retrievable through
//! [`SseParser::final_usage`]. Some upstreams close the connection right
//! after the last `data:` line without the separating blank line;
//! [`SseParser::flush_pending_event`] parses that buffered tail as though
//! the blank line had arrived, and the stream processor calls it exactly
//! once when its read loop ends for any reason.

use serde_json::Value;

use crate::logging::log_trace;

// ============================================================================
// Token usage
// ============================================================================

/// Token counts across the four billing dimensions.
///
/// All counts default to zero; a usage with zero across all four is only
/// ever persisted when the upstream response carried no usage payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// True when no dimension carries a count.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cache_read_tokens == 0
    }

    /// Overwrite each dimension that is present in the given usage JSON
    /// object, leaving absent dimensions untouched.
    fn overwrite_from_json(&mut self, usage: &Value) {
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = v;
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = v;
        }
        if let Some(v) = usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
        {
            self.cache_creation_tokens = v;
        }
        if let Some(v) = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
        {
            self.cache_read_tokens = v;
        }
    }
}

/// Extract model name and usage from a buffered (non-streaming) messages
/// response body. Returns `(None, None)` when the body is not a message
/// JSON object or carries no usage payload.
pub fn parse_buffered_message(body: &[u8]) -> (Option<String>, Option<TokenUsage>) {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return (None, None);
    };
    let model = json
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = json.get("usage").map(|u| {
        let mut tokens = TokenUsage::default();
        tokens.overwrite_from_json(u);
        tokens
    });
    (model, usage)
}

// ============================================================================
// SSE parser
// ============================================================================

/// Line-oriented SSE state machine extracting model identity and token
/// counts while the raw bytes are relayed elsewhere.
///
/// States: idle -> in-event (event name + data accumulator) -> idle on a
/// blank line or flush. Prefix matching is tolerant: both `event:x` and
/// `event: x` are accepted, same for `data:`. Lines with any other prefix
/// are ignored.
///
/// Feeding the same byte stream to a fresh parser always produces the same
/// final usage.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
    in_event: bool,
    usage: TokenUsage,
    usage_seen: bool,
    model: Option<String>,
    api_error: Option<String>,
    events_parsed: u64,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes. Partial lines are buffered across calls. Returns the
    /// number of event boundaries crossed in this chunk, which the stream
    /// processor uses to decide when to flush the client connection.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        let mut boundaries = 0;
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.line_buf);
                let line = trim_line(&raw);
                boundaries += self.handle_line(&line);
            } else {
                self.line_buf.push(byte);
            }
        }
        boundaries
    }

    /// Parse any buffered partial event as though the terminating blank
    /// line had arrived. Invoked exactly once when the read loop ends.
    /// Returns true when something was actually pending, which tells the
    /// stream processor the upstream closed mid-event.
    pub fn flush_pending_event(&mut self) -> bool {
        let had_pending = self.in_event || !self.line_buf.is_empty();
        if !self.line_buf.is_empty() {
            let raw = std::mem::take(&mut self.line_buf);
            let line = trim_line(&raw);
            self.handle_line(&line);
        }
        if self.in_event {
            self.finish_event();
        }
        had_pending
    }

    /// Peek the accumulator. `None` until a usage payload has been seen.
    pub fn final_usage(&self) -> Option<TokenUsage> {
        self.usage_seen.then_some(self.usage)
    }

    /// Model name observed from `message_start`, if any.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Message carried by an upstream `event: error` frame, if one arrived.
    pub fn api_error(&self) -> Option<&str> {
        self.api_error.as_deref()
    }

    /// Count of fully parsed events.
    pub fn events_parsed(&self) -> u64 {
        self.events_parsed
    }

    fn handle_line(&mut self, line: &str) -> usize {
        if line.is_empty() {
            if self.in_event {
                self.finish_event();
                return 1;
            }
            return 0;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_name = Some(strip_leading_space(rest).to_string());
            self.in_event = true;
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines.push(strip_leading_space(rest).to_string());
            self.in_event = true;
        }
        // Any other prefix (comments, id:, retry:) is ignored.
        0
    }

    fn finish_event(&mut self) {
        let name = self.event_name.take();
        let data = std::mem::take(&mut self.data_lines).join("\n");
        self.in_event = false;

        if data.is_empty() {
            return;
        }
        let Ok(json) = serde_json::from_str::<Value>(&data) else {
            log_trace!(data_len = data.len(), "Skipping non-JSON SSE data payload");
            return;
        };
        self.events_parsed += 1;

        // The event name line wins; fall back to the payload's type field.
        let event_type = name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| {
                json.get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        match event_type.as_deref() {
            Some("message_start") => {
                let message = json.get("message").unwrap_or(&Value::Null);
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.model = Some(model.to_string());
                }
                if let Some(usage) = message.get("usage") {
                    self.usage.overwrite_from_json(usage);
                    self.usage_seen = true;
                }
            }
            Some("message_delta") => {
                if let Some(usage) = json.get("usage") {
                    self.usage.overwrite_from_json(usage);
                    self.usage_seen = true;
                }
            }
            Some("error") => {
                let message = json
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.clone());
                self.api_error = Some(message);
            }
            _ => {}
        }
    }
}

fn trim_line(raw: &[u8]) -> String {
    let raw = match raw.last() {
        Some(b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

fn strip_leading_space(s: &str) -> &str {
    s.strip_prefix(' ').unwrap_or(s)
}
