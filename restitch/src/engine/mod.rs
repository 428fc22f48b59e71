// Retry engine.
//
// Drives the attempt loop for one client request: opens the upstream
// stream, feeds it through the phase machine, and on truncation builds a
// continuation request and splices the resumed output into the same
// client-visible stream. Every failure resolves to either a clean
// terminal event or the incomplete-marker event; nothing propagates to
// the client as an error status.
//
// The client connection has exactly one writer: a bounded channel
// drained by the response body. The ingestion loop and the heartbeat
// task both hold senders, so records interleave only at event
// granularity and a disconnect tears both down.

mod unary;


use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::protocol::{
    self, ModelClass, CHUNK_GAP_TIMEOUT, FIRST_CHUNK_TIMEOUT, HEARTBEAT_INTERVAL,
    MAX_FETCH_RETRIES, MAX_NON_RETRYABLE_STATUS_RETRIES,
};
use crate::rewrite;
use crate::stream::{
    encode_data_event, parse_data_payload, AbortReason, Emission, Phase, SseDecoder, SseFrame,
    StreamMachine,
};

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

pub enum HttpBody {
    Full(Bytes),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>),
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

/// Sends HTTP requests to the upstream API. Injected so tests can script
/// upstream behaviour without a network.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Reqwest HTTP sender
// ---------------------------------------------------------------------------

/// Production sender backed by a shared `reqwest::Client`. No whole-call
/// timeout: streams stay open as long as data flows; inactivity is the
/// engine's own concern.
pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let resp = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout(e.to_string())
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        if request.stream {
            let stream = resp
                .bytes_stream()
                .map_err(|e| HttpError::Transport(e.to_string()));
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Stream(Box::pin(stream)),
            })
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Full(body),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One client request, as seen by the engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub model: ModelClass,
    /// Original client path and query, e.g.
    /// `/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse&key=…`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Value,
}

pub struct Engine {
    config: Arc<Config>,
    http: Arc<dyn HttpSender>,
}

impl Engine {
    pub fn new(config: Arc<Config>, http: Arc<dyn HttpSender>) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn http(&self) -> &Arc<dyn HttpSender> {
        &self.http
    }

    /// Run the streaming engine for one request. Returns the SSE byte
    /// stream for the response body; the attempt loop runs in its own
    /// task and ends when the stream is dropped or the request resolves.
    pub fn stream_generate(&self, ctx: RequestContext) -> ReceiverStream<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let config = self.config.clone();
        let http = self.http.clone();
        tokio::spawn(run_stream(config, http, ctx, tx));
        ReceiverStream::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Retry bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryClass {
    /// Retryable statuses, incomplete streams, aborted attempts.
    Retryable,
    /// HTTP errors outside the retryable set.
    NonRetryableStatus,
    /// Network-level faults.
    Fetch,
}

#[derive(Debug)]
pub(crate) struct RetryBudget {
    max_retryable: u32,
    retryable: u32,
    non_retryable: u32,
    fetch: u32,
}

impl RetryBudget {
    pub(crate) fn new(max_retryable: u32) -> Self {
        Self {
            max_retryable,
            retryable: 0,
            non_retryable: 0,
            fetch: 0,
        }
    }

    /// Take one retry slot from the class's budget. False means the
    /// budget is spent and the request must resolve as incomplete.
    pub(crate) fn consume(&mut self, class: RetryClass) -> bool {
        match class {
            RetryClass::Retryable => {
                self.retryable += 1;
                self.retryable <= self.max_retryable
            }
            RetryClass::NonRetryableStatus => {
                self.non_retryable += 1;
                self.non_retryable <= MAX_NON_RETRYABLE_STATUS_RETRIES
            }
            RetryClass::Fetch => {
                self.fetch += 1;
                self.fetch <= MAX_FETCH_RETRIES
            }
        }
    }
}

pub(crate) fn classify_status(status: u16, body: &str) -> RetryClass {
    if protocol::is_retryable_status(status)
        || (status == 400 && protocol::is_effectively_retryable_400(body))
    {
        RetryClass::Retryable
    } else {
        RetryClass::NonRetryableStatus
    }
}

pub(crate) fn client_hides_thoughts(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains(protocol::THOUGHT_HIDING_UA_MARKER))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Streaming attempt loop
// ---------------------------------------------------------------------------

enum AttemptResult {
    Complete,
    Incomplete,
    Aborted(AbortReason),
    Passthrough,
    Status(u16, String),
    Transport(String),
    ClientGone,
}

async fn run_stream(
    config: Arc<Config>,
    http: Arc<dyn HttpSender>,
    ctx: RequestContext,
    tx: mpsc::Sender<Bytes>,
) {
    let model = ctx.model;
    let mut body = ctx.body.clone();
    rewrite::normalize_body(&mut body);
    rewrite::clamp_thinking_budget(&mut body, Some(model));

    let inject_begin = rewrite::begin_injection_enabled(&body, model);
    let include_thoughts = rewrite::include_thoughts(&body);
    let mut current_body = rewrite::inject_protocol_prompts(&body, inject_begin);

    // Shared with the heartbeat task: once the reasoning phase has
    // finished, keep-alives must stop carrying the thought flag.
    let thought_finished = Arc::new(AtomicBool::new(!inject_begin));
    let heartbeat = tokio::spawn(heartbeat_loop(
        tx.clone(),
        thought_finished.clone(),
        client_hides_thoughts(&ctx.headers),
    ));

    let (clean_path, url_key) = rewrite::split_key_param(&ctx.path_and_query);
    let url = format!("{}{}", config.upstream_base, clean_path);
    let headers = rewrite::upstream_headers(&ctx.headers, url_key.as_deref());

    let mut budget = RetryBudget::new(config.max_retries);
    let mut template: Option<Value> = None;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let expect_begin = inject_begin && !thought_finished.load(Ordering::Relaxed);
        let mut machine =
            StreamMachine::new(expect_begin, include_thoughts, &config.thought_prelude);
        machine.set_template(template.clone());

        tracing::debug!(
            request_id = %ctx.request_id,
            attempt,
            model = model.as_str(),
            "opening upstream stream"
        );

        let result = run_attempt(
            http.as_ref(),
            &url,
            &headers,
            &current_body,
            &mut machine,
            model.requires_finish_token(),
            &tx,
        )
        .await;

        if machine.template().is_some() {
            template = machine.template().cloned();
        }
        if machine.has_begin_token() {
            thought_finished.store(true, Ordering::Relaxed);
        }

        match result {
            AttemptResult::ClientGone => {
                tracing::debug!(request_id = %ctx.request_id, attempt, "client disconnected");
                break;
            }
            AttemptResult::Passthrough => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    attempt,
                    "passthrough stream ended"
                );
                break;
            }
            AttemptResult::Complete => {
                let Emission::Event(terminal) = machine.finalize_success() else {
                    break;
                };
                let _ = tx.send(encode_data_event(&terminal)).await;
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt,
                    delivered = machine.delivered_text().len(),
                    "request complete"
                );
                break;
            }
            AttemptResult::Incomplete => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt,
                    delivered = machine.delivered_text().len(),
                    "stream ended without finish marker; retrying"
                );
                if !budget.consume(RetryClass::Retryable) {
                    exhaust(&ctx, &mut machine, &tx).await;
                    break;
                }
                current_body =
                    rewrite::build_continuation(&current_body, machine.delivered_text());
            }
            AttemptResult::Aborted(AbortReason::PrematureBegin) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt,
                    "model skipped its reasoning stage; restarting attempt"
                );
                if !budget.consume(RetryClass::Retryable) {
                    exhaust(&ctx, &mut machine, &tx).await;
                    break;
                }
            }
            AttemptResult::Aborted(AbortReason::GhostLoop) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt,
                    "repetition loop detected; re-anchoring continuation"
                );
                if !budget.consume(RetryClass::Retryable) {
                    exhaust(&ctx, &mut machine, &tx).await;
                    break;
                }
                rewrite::reset_continuation_anchor(&mut current_body, &config.thought_prelude);
            }
            AttemptResult::Status(status, error_body) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    attempt,
                    status,
                    "upstream error status"
                );
                if config.is_fatal_status(status) {
                    let _ = tx.send(Bytes::from(format!("data: {error_body}\n\n"))).await;
                    break;
                }
                if !budget.consume(classify_status(status, &error_body)) {
                    exhaust(&ctx, &mut machine, &tx).await;
                    break;
                }
                if status == 429 && !protocol::is_hard_quota_failure(&error_body) {
                    tokio::time::sleep(protocol::STREAM_QUOTA_BACKOFF).await;
                }
            }
            AttemptResult::Transport(error) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    attempt,
                    error = %error,
                    "upstream transport fault"
                );
                if !budget.consume(RetryClass::Fetch) {
                    exhaust(&ctx, &mut machine, &tx).await;
                    break;
                }
            }
        }
    }

    heartbeat.abort();
}

/// Flush the last attempt's residue and close with the incomplete marker.
async fn exhaust(ctx: &RequestContext, machine: &mut StreamMachine, tx: &mpsc::Sender<Bytes>) {
    tracing::warn!(request_id = %ctx.request_id, "retry budget exhausted");
    let _ = send_emissions(tx, machine.finalize_exhausted()).await;
}

async fn send_emissions(tx: &mpsc::Sender<Bytes>, emissions: Vec<Emission>) -> Result<(), ()> {
    for emission in emissions {
        let bytes = match emission {
            Emission::Event(event) => encode_data_event(&event),
            Emission::Verbatim(line) => Bytes::from(format!("{line}\n")),
        };
        tx.send(bytes).await.map_err(|_| ())?;
    }
    Ok(())
}

/// Run one upstream attempt to completion, feeding events through the
/// machine and forwarding what becomes safe. A read that stalls past the
/// inactivity limit is treated as a clean end of stream.
async fn run_attempt(
    http: &dyn HttpSender,
    url: &str,
    headers: &HeaderMap,
    body: &Value,
    machine: &mut StreamMachine,
    requires_finish: bool,
    tx: &mpsc::Sender<Bytes>,
) -> AttemptResult {
    let payload = Bytes::from(serde_json::to_vec(body).expect("request body serialises"));
    let request = HttpRequest {
        method: Method::POST,
        url: url.to_string(),
        headers: headers.clone(),
        body: payload,
        stream: true,
    };

    let response = match http.send(request).await {
        Ok(r) => r,
        Err(e) => return AttemptResult::Transport(e.to_string()),
    };

    if !response.status.is_success() {
        let text = read_error_body(response.body).await;
        return AttemptResult::Status(response.status.as_u16(), text);
    }

    let mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>> =
        match response.body {
            HttpBody::Stream(s) => s,
            HttpBody::Full(bytes) => Box::pin(futures_util::stream::once(async move { Ok(bytes) })),
        };

    let mut decoder = SseDecoder::new();
    let mut passthrough = false;
    let mut first = true;

    loop {
        let limit = if first { FIRST_CHUNK_TIMEOUT } else { CHUNK_GAP_TIMEOUT };
        let chunk = match tokio::time::timeout(limit, upstream.next()).await {
            Err(_) => break,      // inactivity: treat as clean end
            Ok(None) => break,    // upstream closed
            Ok(Some(Err(e))) => {
                if first {
                    return AttemptResult::Transport(e.to_string());
                }
                break; // mid-stream fault: salvage via continuation
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        first = false;

        if passthrough {
            if tx.send(chunk).await.is_err() {
                return AttemptResult::ClientGone;
            }
            continue;
        }

        for frame in decoder.feed(&chunk) {
            if passthrough {
                let raw = match &frame {
                    SseFrame::Data { raw, .. } => raw,
                    SseFrame::Verbatim(line) => line,
                };
                if tx.send(Bytes::from(format!("{raw}\n"))).await.is_err() {
                    return AttemptResult::ClientGone;
                }
                continue;
            }
            match handle_frame(frame, machine, tx).await {
                FrameOutcome::Ok => {}
                FrameOutcome::Passthrough => passthrough = true,
                FrameOutcome::Aborted(reason) => return AttemptResult::Aborted(reason),
                FrameOutcome::ClientGone => return AttemptResult::ClientGone,
            }
        }

        if passthrough {
            let residue = decoder.take_raw();
            if !residue.is_empty() && tx.send(residue).await.is_err() {
                return AttemptResult::ClientGone;
            }
        }
    }

    if passthrough {
        return AttemptResult::Passthrough;
    }

    if let Some(frame) = decoder.finish() {
        match handle_frame(frame, machine, tx).await {
            FrameOutcome::Aborted(reason) => return AttemptResult::Aborted(reason),
            FrameOutcome::ClientGone => return AttemptResult::ClientGone,
            _ => {}
        }
    }

    if machine.is_complete(requires_finish) {
        AttemptResult::Complete
    } else {
        AttemptResult::Incomplete
    }
}

enum FrameOutcome {
    Ok,
    Passthrough,
    Aborted(AbortReason),
    ClientGone,
}

async fn handle_frame(
    frame: SseFrame,
    machine: &mut StreamMachine,
    tx: &mpsc::Sender<Bytes>,
) -> FrameOutcome {
    match frame {
        SseFrame::Data { payload, .. } => {
            let Some(event) = parse_data_payload(&payload) else {
                return FrameOutcome::Ok;
            };
            match machine.on_event(event) {
                crate::stream::StepOutcome::Continue(emissions) => {
                    if send_emissions(tx, emissions).await.is_err() {
                        return FrameOutcome::ClientGone;
                    }
                    FrameOutcome::Ok
                }
                crate::stream::StepOutcome::EnterPassthrough(emissions) => {
                    if send_emissions(tx, emissions).await.is_err() {
                        return FrameOutcome::ClientGone;
                    }
                    debug_assert_eq!(machine.phase(), Phase::Passthrough);
                    FrameOutcome::Passthrough
                }
                crate::stream::StepOutcome::Abort(reason) => FrameOutcome::Aborted(reason),
            }
        }
        SseFrame::Verbatim(line) => {
            if tx.send(Bytes::from(format!("{line}\n"))).await.is_err() {
                return FrameOutcome::ClientGone;
            }
            FrameOutcome::Ok
        }
    }
}

async fn read_error_body(body: HttpBody) -> String {
    match body {
        HttpBody::Full(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        HttpBody::Stream(mut stream) => {
            let mut collected = Vec::new();
            let collect = async {
                while let Some(Ok(chunk)) = stream.next().await {
                    collected.extend_from_slice(&chunk);
                    if collected.len() > 64 * 1024 {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(Duration::from_secs(10), collect).await;
            String::from_utf8_lossy(&collected).into_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Emit an empty-text event every `HEARTBEAT_INTERVAL` while the response
/// is open, defeating client and middle-box idle timers. While the
/// reasoning phase is still running the event is flagged as thought, so
/// clients that render reasoning show activity; clients that hide
/// reasoning entirely get unflagged events instead.
pub(crate) async fn heartbeat_loop(
    tx: mpsc::Sender<Bytes>,
    thought_finished: Arc<AtomicBool>,
    suppress_thought_flag: bool,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        let part = if !suppress_thought_flag && !thought_finished.load(Ordering::Relaxed) {
            json!({ "text": "", "thought": true })
        } else {
            json!({ "text": "" })
        };
        let event = json!({
            "candidates": [{ "content": { "parts": [part], "role": "model" }, "index": 0 }]
        });
        if tx.send(encode_data_event(&event)).await.is_err() {
            return;
        }
    }
}
