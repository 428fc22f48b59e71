// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Client-facing HTTP surface.
//
// Responsibilities:
// - CORS preflight handling
// - Deciding per request whether the retry engine is engaged: only POSTs
//   to generate endpoints of allow-listed models, and never for
//   schema-constrained output
// - SSE response framing for engine streams
// - Verbatim passthrough for everything else
// - Health endpoint

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{Engine, HttpBody, HttpRequest, HttpSender, RequestContext};
use crate::protocol::ModelClass;
use crate::rewrite;

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Routing decision
// ---------------------------------------------------------------------------

/// How a request path maps onto the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Streaming generate endpoint for an allow-listed model.
    Stream(ModelClass),
    /// Non-streaming generate endpoint for an allow-listed model.
    Unary(ModelClass),
    /// Everything else: forwarded untouched.
    Passthrough,
}

/// Classify a request path. The engine only engages for generate calls
/// on models that speak the sentinel protocol; `streamGenerateContent`
/// is matched first because it contains `generateContent` as a substring.
pub fn classify_path(path: &str) -> RouteKind {
    let Some(model) = ModelClass::from_path(path) else {
        return RouteKind::Passthrough;
    };
    if path.contains(":streamGenerateContent") {
        RouteKind::Stream(model)
    } else if path.contains(":generateContent") {
        RouteKind::Unary(model)
    } else {
        RouteKind::Passthrough
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
    pub http: Arc<dyn HttpSender>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// Answer CORS preflights permissively; browser clients talk to the
/// proxy from arbitrary origins.
fn cors_preflight() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Authorization, X-Goog-Api-Key",
        )
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
        .body(Body::empty())
        .expect("static response builds")
}

/// Single entry point for every proxied path.
pub async fn dispatch(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    if method == Method::OPTIONS {
        return cors_preflight();
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path())
        .to_string();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {e}"),
            )
                .into_response()
        }
    };

    let kind = if method == Method::POST {
        classify_path(uri.path())
    } else {
        RouteKind::Passthrough
    };

    let model = match kind {
        RouteKind::Passthrough => {
            return passthrough(&state, method, &path_and_query, &headers, body).await;
        }
        RouteKind::Stream(m) | RouteKind::Unary(m) => m,
    };

    // The engine needs a JSON body it can rewrite, and schema-constrained
    // generation cannot carry sentinel markers; both fall back to
    // forwarding untouched.
    let json_body: Option<Value> = serde_json::from_slice(&body).ok();
    let engine_body = match json_body {
        Some(v) if !rewrite::has_response_schema(&v) => v,
        _ => {
            return passthrough(&state, method, &path_and_query, &headers, body).await;
        }
    };

    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
        model,
        path_and_query,
        headers,
        body: engine_body,
    };

    tracing::debug!(
        request_id = %ctx.request_id,
        model = model.as_str(),
        streaming = matches!(kind, RouteKind::Stream(_)),
        "engine engaged"
    );

    match kind {
        RouteKind::Stream(_) => {
            let stream = state
                .engine
                .stream_generate(ctx)
                .map(Ok::<Bytes, std::io::Error>);
            sse_response(Body::from_stream(stream))
        }
        RouteKind::Unary(_) => {
            let out = state.engine.generate(ctx).await;
            json_response(&out)
        }
        RouteKind::Passthrough => unreachable!("handled above"),
    }
}

fn sse_response(body: Body) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "text/event-stream; charset=utf-8",
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .expect("static response builds")
}

fn json_response(value: &Value) -> Response<Body> {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(bytes))
        .expect("static response builds")
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

/// Forward a request to the upstream untouched and stream the response
/// back, preserving status and headers. The client's Host header points
/// at this proxy and is dropped; the HTTP client sets the right one from
/// the upstream URL.
async fn passthrough(
    state: &AppState,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let url = format!("{}{}", state.config.upstream_base, path_and_query);

    let mut fwd_headers = headers.clone();
    fwd_headers.remove(header::HOST);

    let request = HttpRequest {
        method,
        url,
        headers: fwd_headers,
        body,
        stream: true,
    };

    let upstream = match state.http.send(request).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "passthrough upstream failure");
            return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
        }
    };

    let mut response = Response::builder().status(upstream.status);
    if let Some(h) = response.headers_mut() {
        *h = upstream.headers;
        h.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }

    let body = match upstream.body {
        HttpBody::Full(bytes) => Body::from(bytes),
        HttpBody::Stream(stream) => {
            Body::from_stream(stream.map(|item| item.map_err(std::io::Error::other)))
        }
    };
    response.body(body).expect("response builds")
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

/// Build the axum router: a health route plus the catch-all dispatcher.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(dispatch)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_paths_classified() {
        assert_eq!(
            classify_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            RouteKind::Stream(ModelClass::Pro)
        );
        assert_eq!(
            classify_path("/v1beta/models/gemini-2.5-flash-lite:streamGenerateContent"),
            RouteKind::Stream(ModelClass::FlashLite)
        );
    }

    #[test]
    fn unary_paths_classified() {
        assert_eq!(
            classify_path("/v1beta/models/gemini-2.5-flash:generateContent"),
            RouteKind::Unary(ModelClass::Flash)
        );
    }

    #[test]
    fn unlisted_models_pass_through() {
        assert_eq!(
            classify_path("/v1beta/models/gemini-1.5-pro:streamGenerateContent"),
            RouteKind::Passthrough
        );
        assert_eq!(
            classify_path("/v1beta/models/gemini-2.5-pro:countTokens"),
            RouteKind::Passthrough
        );
        assert_eq!(classify_path("/v1beta/models"), RouteKind::Passthrough);
    }
}
