// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Request rewriter.
//
// Edits the client's request body before each upstream attempt: folds the
// snake_case system-instruction alias, injects the sentinel prompt blocks,
// clamps the thinking budget, and on retries extends `contents` with the
// partial answer plus a resume prompt. Bodies are treated as opaque
// `serde_json::Value` trees; only the fields this proxy cares about are
// ever touched.

use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::protocol::{
    self, ModelClass, FINISHED_TOKEN, FINISH_REMINDER, PROMPT_SEPARATOR, RESUME_PROMPT,
};

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Fold the `system_instruction` alias into the canonical
/// `systemInstruction` key. The canonical key wins on conflict; the alias
/// is always removed. Idempotent.
pub fn normalize_body(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    if let Some(alias) = obj.remove("system_instruction") {
        obj.entry("systemInstruction").or_insert(alias);
    }
}

/// Whether the request asks for schema-constrained output. Such requests
/// bypass the engine entirely: a grammar-constrained decoder cannot emit
/// sentinel markers.
pub fn has_response_schema(body: &Value) -> bool {
    body.pointer("/generationConfig/responseSchema").is_some()
}

fn thinking_budget(body: &Value) -> Option<i64> {
    body.pointer("/generationConfig/thinkingConfig/thinkingBudget")?
        .as_i64()
}

/// Whether the begin-marker prompt is injected for this request. A budget
/// of zero means reasoning is disabled and there is no thought phase to
/// delimit; absent a budget, the model class decides.
pub fn begin_injection_enabled(body: &Value, model: ModelClass) -> bool {
    match thinking_budget(body) {
        Some(0) => false,
        Some(b) if b > 0 => true,
        _ => model.thinks_by_default(),
    }
}

/// Whether reasoning content is surfaced to the client.
pub fn include_thoughts(body: &Value) -> bool {
    body.pointer("/generationConfig/thinkingConfig/includeThoughts")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Clamp a positive thinking budget into the model's supported range.
/// Zero and negative (dynamic) budgets are left untouched.
pub fn clamp_thinking_budget(body: &mut Value, model: Option<ModelClass>) {
    let (min, max) = model
        .map(|m| m.thinking_budget_range())
        .unwrap_or(protocol::DEFAULT_THINKING_BUDGET_RANGE);
    if let Some(slot) = body.pointer_mut("/generationConfig/thinkingConfig/thinkingBudget") {
        if let Some(b) = slot.as_i64() {
            if b > 0 {
                *slot = json!(b.clamp(min, max));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sentinel prompt injection
// ---------------------------------------------------------------------------

/// Produce the body actually sent upstream on a first attempt.
///
/// Appends (never replaces) the active protocol blocks to the system
/// instruction, teaches the finish marker by example on prior model turns,
/// and glues the reminder onto the final user turn.
pub fn inject_protocol_prompts(body: &Value, inject_begin: bool) -> Value {
    let mut out = body.clone();
    normalize_body(&mut out);

    append_system_blocks(&mut out, inject_begin);

    if let Some(contents) = out.get_mut("contents").and_then(Value::as_array_mut) {
        for content in contents.iter_mut() {
            if content.get("role").and_then(Value::as_str) == Some("model") {
                append_to_last_text_part(content, FINISHED_TOKEN);
            }
        }
        if let Some(last_user) = contents
            .iter_mut()
            .rev()
            .find(|c| c.get("role").and_then(Value::as_str) == Some("user"))
        {
            append_to_last_nonempty_text_part(last_user, FINISH_REMINDER);
        }
    }

    out
}

fn append_system_blocks(body: &mut Value, inject_begin: bool) {
    let obj = match body.as_object_mut() {
        Some(o) => o,
        None => return,
    };

    let si = obj
        .entry("systemInstruction")
        .or_insert_with(|| json!({ "parts": [{ "text": "" }] }));
    if !si.is_object() {
        *si = json!({ "parts": [{ "text": "" }] });
    }

    let parts = si
        .as_object_mut()
        .expect("systemInstruction is an object")
        .entry("parts")
        .or_insert_with(|| json!([{ "text": "" }]));
    if !matches!(parts.as_array(), Some(a) if !a.is_empty()) {
        *parts = json!([{ "text": "" }]);
    }

    let first = &mut parts.as_array_mut().expect("parts is an array")[0];
    let existing = first.get("text").and_then(Value::as_str).unwrap_or("");

    let mut text = existing.to_string();
    if inject_begin {
        text.push_str(PROMPT_SEPARATOR);
        text.push_str(protocol::OUTPUT_START_PROTOCOL);
    }
    text.push_str(PROMPT_SEPARATOR);
    text.push_str(protocol::FINAL_OUTPUT_PROTOCOL);
    first["text"] = json!(text);
}

fn append_to_last_text_part(content: &mut Value, suffix: &str) {
    let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
        return;
    };
    if let Some(part) = parts
        .iter_mut()
        .rev()
        .find(|p| p.get("text").map_or(false, Value::is_string))
    {
        let text = part["text"].as_str().unwrap_or("").to_string();
        part["text"] = json!(format!("{text}{suffix}"));
    } else {
        parts.push(json!({ "text": suffix }));
    }
}

fn append_to_last_nonempty_text_part(content: &mut Value, suffix: &str) {
    let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
        return;
    };
    if let Some(part) = parts
        .iter_mut()
        .rev()
        .find(|p| matches!(p.get("text").and_then(Value::as_str), Some(t) if !t.is_empty()))
    {
        let text = part["text"].as_str().unwrap_or("").to_string();
        part["text"] = json!(format!("{text}{suffix}"));
    } else {
        parts.push(json!({ "text": suffix }));
    }
}

// ---------------------------------------------------------------------------
// Continuation assembly
// ---------------------------------------------------------------------------

/// Build the request body for a retry attempt.
///
/// Inserts, immediately after the last user turn, the partial answer the
/// client has already seen (as a model turn) and the resume prompt (as a
/// user turn). When almost nothing was delivered, a plain re-issue of the
/// current body beats asking the model to resume a few characters.
pub fn build_continuation(current: &Value, delivered_text: &str) -> Value {
    if delivered_text.chars().count() <= FINISHED_TOKEN.len() {
        return current.clone();
    }

    let mut out = current.clone();
    normalize_body(&mut out);

    let model_turn = json!({ "role": "model", "parts": [{ "text": delivered_text }] });
    let user_turn = json!({ "role": "user", "parts": [{ "text": RESUME_PROMPT }] });

    let contents = match out.get_mut("contents").and_then(Value::as_array_mut) {
        Some(c) => c,
        None => {
            out["contents"] = json!([model_turn, user_turn]);
            return out;
        }
    };

    let last_user = contents
        .iter()
        .rposition(|c| c.get("role").and_then(Value::as_str) == Some("user"));

    match last_user {
        Some(idx) => {
            contents.insert(idx + 1, model_turn);
            contents.insert(idx + 2, user_turn);
        }
        None => {
            contents.push(model_turn);
            contents.push(user_turn);
        }
    }

    out
}

/// Repetition-loop remediation: when the model keeps re-emitting its
/// reasoning prelude instead of continuing, rewrite the final model turn
/// to exactly the prelude so the next attempt resumes from a known prefix.
///
/// Returns false when the last content is not a model turn (nothing to
/// re-anchor).
pub fn reset_continuation_anchor(body: &mut Value, prelude: &str) -> bool {
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return false;
    };
    let Some(last) = contents.last_mut() else {
        return false;
    };
    if last.get("role").and_then(Value::as_str) != Some("model") {
        return false;
    }

    let Some(parts) = last.get_mut("parts").and_then(Value::as_array_mut) else {
        return false;
    };
    if let Some(part) = parts
        .iter_mut()
        .rev()
        .find(|p| p.get("text").map_or(false, Value::is_string))
    {
        part["text"] = json!(prelude);
    } else {
        parts.push(json!({ "text": prelude }));
    }
    true
}

// ---------------------------------------------------------------------------
// Upstream request construction
// ---------------------------------------------------------------------------

/// Strip the `key` query parameter out of a path-and-query string,
/// returning the cleaned path and the extracted key, if any. The key is
/// re-attached as a header so it never appears in upstream access logs.
pub fn split_key_param(path_and_query: &str) -> (String, Option<String>) {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return (path_and_query.to_string(), None);
    };

    let mut kept = Vec::new();
    let mut key = None;
    for pair in query.split('&') {
        if let Some(v) = pair.strip_prefix("key=") {
            key = Some(v.to_string());
        } else if !pair.is_empty() {
            kept.push(pair);
        }
    }

    let cleaned = if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    };
    (cleaned, key)
}

/// Headers for an upstream attempt: Content-Type carried over, the API
/// key normalised into `X-Goog-Api-Key`, and a fixed User-Agent.
pub fn upstream_headers(client_headers: &HeaderMap, key_from_url: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    match client_headers.get(header::CONTENT_TYPE) {
        Some(ct) => {
            headers.insert(header::CONTENT_TYPE, ct.clone());
        }
        None => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
    }

    if let Some(key) = client_headers.get("x-goog-api-key") {
        headers.insert("x-goog-api-key", key.clone());
    } else if let Some(key) = key_from_url {
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("x-goog-api-key", value);
        }
    }

    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(protocol::PROXY_USER_AGENT),
    );
    headers
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
