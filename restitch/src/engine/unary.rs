// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Non-streaming adapter.
//
// The same sentinel protocol applied to a single JSON response: rewrite
// the request, POST once, walk the returned parts through the thought /
// formal split, and retry with a continuation until the finish marker
// shows up or the budget runs out. Begin-marker detection here checks
// one part's text at a time; there are no cross-event boundaries to
// bridge in a fully materialised response.

use std::io::Read as _;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use serde_json::{json, Value};

use super::{classify_status, read_error_body, Engine, HttpBody, HttpRequest, RetryBudget, RetryClass};
use crate::protocol::{
    self, EXHAUSTED_FINISH_REASON, FINISHED_TOKEN, INCOMPLETE_TOKEN, UNARY_QUOTA_BACKOFF,
};
use crate::rewrite;
use crate::stream::{clean_final_text, make_event, scrub_markers, text_part, thought_part};

// ---------------------------------------------------------------------------
// Part scanning
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartScan {
    thought: String,
    formal: String,
    got_begin: bool,
    function_parts: Vec<Value>,
}

/// Split a response's parts into reasoning and answer text. Before the
/// begin marker is found, unflagged text counts as reasoning the model
/// failed to tag; the part containing the marker is split around it.
fn scan_parts(parts: &[Value], expect_begin: bool) -> PartScan {
    let mut scan = PartScan::default();

    for part in parts {
        if part.get("functionCall").is_some() {
            scan.function_parts.push(part.clone());
            continue;
        }
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            scan.thought.push_str(text);
            continue;
        }

        if expect_begin && !scan.got_begin {
            match find_begin(text) {
                Some(at) => {
                    scan.thought.push_str(&text[..at]);
                    scan.formal
                        .push_str(&text[at + protocol::BEGIN_TOKEN.len()..]);
                    scan.got_begin = true;
                }
                None => scan.thought.push_str(text),
            }
        } else {
            scan.formal.push_str(text);
        }
    }
    scan
}

/// First begin marker not sitting behind a backtick.
fn find_begin(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = text[from..].find(protocol::BEGIN_TOKEN) {
        let at = from + found;
        if at == 0 || text.as_bytes()[at - 1] != b'`' {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Engine entry point
// ---------------------------------------------------------------------------

impl Engine {
    /// Run the non-streaming engine for one request. Always resolves to a
    /// response body; upstream failures become the incomplete-marker
    /// response once the retry budget is spent.
    pub async fn generate(&self, ctx: super::RequestContext) -> Value {
        let config = self.config().clone();
        let model = ctx.model;

        let mut body = ctx.body.clone();
        rewrite::normalize_body(&mut body);
        rewrite::clamp_thinking_budget(&mut body, Some(model));

        let inject_begin = rewrite::begin_injection_enabled(&body, model);
        let include_thoughts = rewrite::include_thoughts(&body);
        let mut current_body = rewrite::inject_protocol_prompts(&body, inject_begin);

        let (clean_path, url_key) = rewrite::split_key_param(&ctx.path_and_query);
        let url = format!("{}{}", config.upstream_base, clean_path);
        let headers = rewrite::upstream_headers(&ctx.headers, url_key.as_deref());

        let mut budget = RetryBudget::new(config.max_retries);
        let mut template: Option<Value> = None;
        let mut thought_finished = !inject_begin;
        let mut assembled_thought = String::new();
        let mut assembled_formal = String::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let expect_begin = inject_begin && !thought_finished;

            let response = match self.post_json(&url, &headers, &current_body).await {
                Ok(r) => r,
                Err(error) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        attempt,
                        error = %error,
                        "upstream transport fault"
                    );
                    if !budget.consume(RetryClass::Fetch) {
                        return exhausted_response(template.as_ref(), &assembled_formal);
                    }
                    continue;
                }
            };

            let (status, resp_headers, resp_body) = response;
            if !status.is_success() {
                let error_body = read_error_body(resp_body).await;
                tracing::warn!(
                    request_id = %ctx.request_id,
                    attempt,
                    status = status.as_u16(),
                    "upstream error status"
                );
                if config.is_fatal_status(status.as_u16()) {
                    return serde_json::from_str(&error_body)
                        .unwrap_or_else(|_| json!({ "error": error_body }));
                }
                if !budget.consume(classify_status(status.as_u16(), &error_body)) {
                    return exhausted_response(template.as_ref(), &assembled_formal);
                }
                if status.as_u16() == 429 && !protocol::is_hard_quota_failure(&error_body) {
                    tokio::time::sleep(UNARY_QUOTA_BACKOFF).await;
                }
                continue;
            }

            let bytes = match resp_body {
                HttpBody::Full(b) => b,
                HttpBody::Stream(_) => Bytes::from(read_error_body(resp_body).await),
            };
            let bytes = match maybe_decompress(&resp_headers, bytes) {
                Ok(b) => b,
                Err(error) => {
                    tracing::warn!(request_id = %ctx.request_id, attempt, error = %error, "bad upstream body");
                    if !budget.consume(RetryClass::Fetch) {
                        return exhausted_response(template.as_ref(), &assembled_formal);
                    }
                    continue;
                }
            };
            let Ok(upstream) = serde_json::from_slice::<Value>(&bytes) else {
                if !budget.consume(RetryClass::Fetch) {
                    return exhausted_response(template.as_ref(), &assembled_formal);
                }
                continue;
            };

            template = Some(upstream.clone());

            let parts = upstream
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let scan = scan_parts(&parts, expect_begin);

            // Function calls bypass the completion protocol entirely.
            if !scan.function_parts.is_empty() {
                return function_call_response(
                    &upstream,
                    &config.thought_prelude,
                    &assembled_formal,
                    &scan,
                );
            }

            let begin_ok = scan.got_begin || !expect_begin;
            let finished = scan.formal.trim_end().ends_with(FINISHED_TOKEN)
                || !model.requires_finish_token();

            if begin_ok && finished {
                let full_formal = format!(
                    "{assembled_formal}{}",
                    scrub_markers(&clean_final_text(&scan.formal))
                );
                let mut out_parts = Vec::new();
                let full_thought = format!("{assembled_thought}{}", scan.thought);
                if include_thoughts && !full_thought.is_empty() {
                    out_parts.push(thought_part(&full_thought));
                }
                out_parts.push(text_part(&full_formal));
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt,
                    "request complete"
                );
                return make_event(Some(&upstream), out_parts, Some("STOP"));
            }

            tracing::info!(
                request_id = %ctx.request_id,
                attempt,
                got_begin = scan.got_begin,
                "incomplete response; retrying"
            );
            if !budget.consume(RetryClass::Retryable) {
                return exhausted_response(template.as_ref(), &assembled_formal);
            }

            if scan.got_begin {
                thought_finished = true;
            }
            assembled_thought.push_str(&scan.thought);
            let fragment = scrub_markers(&scan.formal);
            if fragment.chars().count() > FINISHED_TOKEN.len() {
                assembled_formal.push_str(&fragment);
            }
            current_body = rewrite::build_continuation(&current_body, &fragment);
        }
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &Value,
    ) -> Result<(axum::http::StatusCode, HeaderMap, HttpBody), super::HttpError> {
        let request = HttpRequest {
            method: Method::POST,
            url: url.to_string(),
            headers: headers.clone(),
            body: Bytes::from(serde_json::to_vec(body).expect("request body serialises")),
            stream: false,
        };
        let response = self.http().send(request).await?;
        Ok((response.status, response.headers, response.body))
    }
}

// ---------------------------------------------------------------------------
// Response assembly
// ---------------------------------------------------------------------------

fn function_call_response(
    upstream: &Value,
    prelude: &str,
    assembled_formal: &str,
    scan: &PartScan,
) -> Value {
    let cleaned = scrub_markers(&clean_final_text(&scan.formal));
    let mut parts = vec![thought_part(prelude)];
    let full = format!("{assembled_formal}{cleaned}");
    if !full.is_empty() {
        parts.push(text_part(&full));
    }
    parts.extend(scan.function_parts.iter().cloned());
    make_event(Some(upstream), parts, None)
}

fn exhausted_response(template: Option<&Value>, assembled_formal: &str) -> Value {
    let text = format!("{assembled_formal}\n{INCOMPLETE_TOKEN}");
    make_event(template, vec![text_part(&text)], Some(EXHAUSTED_FINISH_REASON))
}

// ---------------------------------------------------------------------------
// Body decompression
// ---------------------------------------------------------------------------

fn content_encoding_is(headers: &HeaderMap, encoding: &str) -> bool {
    headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case(encoding))
        .unwrap_or(false)
}

/// Decompress a gzip- or deflate-encoded upstream body so it can be
/// parsed. Streaming responses are never compressed by the upstream;
/// only this adapter needs it.
fn maybe_decompress(headers: &HeaderMap, body: Bytes) -> Result<Bytes, String> {
    if content_encoding_is(headers, "gzip") {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| format!("gzip decompression failed: {e}"))?;
        Ok(Bytes::from(out))
    } else if content_encoding_is(headers, "deflate") {
        let mut decoder = DeflateDecoder::new(&body[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| format!("deflate decompression failed: {e}"))?;
        Ok(Bytes::from(out))
    } else {
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(text: &str) -> Value {
        json!({ "text": text })
    }

    fn thought(text: &str) -> Value {
        json!({ "text": text, "thought": true })
    }

    #[test]
    fn scan_splits_around_begin_marker() {
        let parts = vec![
            thought("weighing options"),
            part("untagged musing [RESPONSE_BEGIN]the answer"),
        ];
        let scan = scan_parts(&parts, true);
        assert!(scan.got_begin);
        assert_eq!(scan.thought, "weighing optionsuntagged musing ");
        assert_eq!(scan.formal, "the answer");
    }

    #[test]
    fn scan_without_begin_expectation_keeps_text_formal() {
        let parts = vec![part("plain answer")];
        let scan = scan_parts(&parts, false);
        assert!(!scan.got_begin);
        assert_eq!(scan.formal, "plain answer");
        assert!(scan.thought.is_empty());
    }

    #[test]
    fn scan_backtick_guard_applies() {
        let parts = vec![part("```[RESPONSE_BEGIN]fenced")];
        let scan = scan_parts(&parts, true);
        assert!(!scan.got_begin);
        assert_eq!(scan.thought, "```[RESPONSE_BEGIN]fenced");
    }

    #[test]
    fn scan_collects_function_parts() {
        let parts = vec![
            part("before the call"),
            json!({ "functionCall": { "name": "f", "args": {} } }),
        ];
        let scan = scan_parts(&parts, false);
        assert_eq!(scan.function_parts.len(), 1);
        assert_eq!(scan.formal, "before the call");
    }

    #[test]
    fn function_call_response_shape() {
        let upstream = json!({
            "candidates": [{ "content": { "parts": [], "role": "model" }, "index": 0 }]
        });
        let scan = PartScan {
            thought: String::new(),
            formal: format!("text{FINISHED_TOKEN}"),
            got_begin: false,
            function_parts: vec![json!({ "functionCall": { "name": "f", "args": {} } })],
        };
        let out = function_call_response(&upstream, "Thinking Process:", "", &scan);
        let parts = out
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[0]["text"], "Thinking Process:");
        assert_eq!(parts[1]["text"], "text");
        assert!(parts[2].get("functionCall").is_some());
    }

    #[test]
    fn exhausted_response_carries_marker_and_reason() {
        let out = exhausted_response(None, "partial");
        assert_eq!(
            out.pointer("/candidates/0/finishReason"),
            Some(&json!(EXHAUSTED_FINISH_REASON))
        );
        let text = out
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.starts_with("partial"));
        assert!(text.ends_with(INCOMPLETE_TOKEN));
    }

    #[test]
    fn gzip_body_decompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_ENCODING,
            axum::http::HeaderValue::from_static("gzip"),
        );
        let out = maybe_decompress(&headers, Bytes::from(compressed)).unwrap();
        assert_eq!(&out[..], b"{\"ok\":true}");
    }
}
