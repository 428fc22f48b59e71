// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// SSE codec.
//
// Decodes upstream bytes into `data:` payloads and verbatim lines, and
// re-encodes edited events. Decoding is line-buffered: TCP chunks do not
// align with SSE line boundaries, so partial lines are held until the
// terminating newline arrives. Splitting on the (ASCII) newline before
// UTF-8 conversion also keeps multi-byte characters that straddle chunk
// boundaries intact.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::protocol::{
    BEGIN_TOKEN, FINISHED_TOKEN, MAX_EVENT_JSON_BYTES, MAX_EVENT_TEXT_BYTES,
};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One complete line from the upstream SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// A `data:` line. `raw` keeps the original line so passthrough mode
    /// can replay it byte-faithfully; `payload` has the prefix stripped.
    Data { raw: String, payload: String },
    /// Anything else (comments, blank separators) — forwarded untouched.
    Verbatim(String),
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Line-buffering SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk, returning every complete line it finishes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop(); // \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            frames.push(parse_line(&String::from_utf8_lossy(&line)));
        }
        frames
    }

    /// Parse whatever is left at stream end as a final, unterminated line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        Some(parse_line(&line))
    }

    /// Surrender the raw residue untouched. Used when flipping to
    /// passthrough mode, where bytes must flow exactly as received.
    pub fn take_raw(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buffer))
    }
}

fn parse_line(line: &str) -> SseFrame {
    let trimmed = line.trim_start();
    if let Some(payload) = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))
    {
        SseFrame::Data {
            raw: line.to_string(),
            payload: payload.to_string(),
        }
    } else {
        SseFrame::Verbatim(line.to_string())
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse a `data:` payload into JSON. Oversized or malformed payloads are
/// rejected (`None`); callers drop the event rather than forward garbage.
pub fn parse_data_payload(payload: &str) -> Option<Value> {
    if payload.len() > MAX_EVENT_JSON_BYTES {
        tracing::warn!(bytes = payload.len(), "dropping oversized event payload");
        return None;
    }
    serde_json::from_str(payload.trim()).ok()
}

/// Content extracted from one event's `candidates[0].content.parts`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtractedParts {
    /// Concatenated text of parts flagged `thought:true`.
    pub thought_text: String,
    /// Concatenated text of unflagged parts, capped per event.
    pub response_text: String,
    pub has_thought: bool,
    pub has_function_call: bool,
}

/// Walk an event's parts, separating reasoning from answer text and
/// noting function calls. Response text is capped so one hostile event
/// cannot balloon the buffers.
pub fn extract_parts(event: &Value) -> ExtractedParts {
    let mut out = ExtractedParts::default();

    let Some(parts) = event
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    else {
        return out;
    };

    for part in parts {
        let text = part.get("text").and_then(Value::as_str);
        let is_thought = part.get("thought").and_then(Value::as_bool) == Some(true);

        if is_thought {
            out.has_thought = true;
            if let Some(t) = text {
                out.thought_text.push_str(t);
            }
        } else if let Some(t) = text {
            let room = MAX_EVENT_TEXT_BYTES.saturating_sub(out.response_text.len());
            if room > 0 {
                out.response_text.push_str(truncate_to_boundary(t, room));
            }
        } else if part.get("functionCall").is_some() {
            out.has_function_call = true;
        }
    }
    out
}

fn truncate_to_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ---------------------------------------------------------------------------
// Event construction
// ---------------------------------------------------------------------------

pub fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

pub fn thought_part(text: &str) -> Value {
    json!({ "text": text, "thought": true })
}

/// Build an outgoing event from an upstream template, replacing only the
/// parts and finish reason. Upstream metadata (index, usage, safety) is
/// carried through untouched.
pub fn make_event(template: Option<&Value>, parts: Vec<Value>, finish_reason: Option<&str>) -> Value {
    let mut event = template.cloned().unwrap_or_else(|| {
        json!({ "candidates": [{ "content": { "parts": [], "role": "model" }, "index": 0 }] })
    });

    if event.pointer("/candidates/0").is_none() {
        event = json!({ "candidates": [{ "content": { "parts": [], "role": "model" }, "index": 0 }] });
    }

    let candidate = &mut event["candidates"][0];
    candidate["content"] = json!({ "parts": parts, "role": "model" });
    match finish_reason {
        Some(reason) => candidate["finishReason"] = json!(reason),
        None => {
            if let Some(obj) = candidate.as_object_mut() {
                obj.remove("finishReason");
            }
        }
    }
    event
}

/// Serialise an event as one SSE record.
pub fn encode_data_event(event: &Value) -> Bytes {
    Bytes::from(format!("data: {event}\n\n"))
}

// ---------------------------------------------------------------------------
// Text cleanup
// ---------------------------------------------------------------------------

/// Strip a trailing finish marker and the whitespace hugging it. Leading
/// whitespace is preserved: the marker is an appendix, not part of the
/// answer.
pub fn clean_final_text(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.strip_suffix(FINISHED_TOKEN) {
        Some(body) => body.trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Remove every occurrence of both marker tokens. Applied to formal text
/// on its way to the client: a model that re-emits a marker mid-answer
/// must not leak it.
pub fn scrub_markers(text: &str) -> String {
    if !text.contains('[') {
        return text.to_string();
    }
    text.replace(FINISHED_TOKEN, "").replace(BEGIN_TOKEN, "")
}

/// Strip a trailing *partial* finish marker: the longest suffix of `text`
/// that is a proper prefix of the marker. Used when a function call cuts
/// the text phase short and an in-flight marker must not leak.
pub fn strip_partial_finish(text: &str) -> &str {
    for start in (0..text.len()).rev() {
        if !text.is_char_boundary(start) {
            continue;
        }
        let tail = &text[start..];
        if tail.len() < FINISHED_TOKEN.len() && FINISHED_TOKEN.starts_with(tail) {
            return &text[..start];
        }
    }
    text
}
