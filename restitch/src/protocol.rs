// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Sentinel protocol constants.
//
// The upstream model is instructed to bracket its formal answer with
// literal marker tokens. Their presence/absence is the ground truth the
// retry engine uses to decide whether a stream finished or was cut off.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Sentinel tokens
// ---------------------------------------------------------------------------

/// Emitted by the model exactly once, as the very first bytes of its
/// formal answer.
pub const BEGIN_TOKEN: &str = "[RESPONSE_BEGIN]";

/// Emitted by the model exactly once, as the very last bytes of its output.
pub const FINISHED_TOKEN: &str = "[RESPONSE_FINISHED]";

/// Appended by the proxy itself when the retry budget is exhausted and the
/// answer is known to be incomplete.
pub const INCOMPLETE_TOKEN: &str = "[RESPONSE_NOT_FINISHED]";

/// Characters of formal text withheld from the client at all times, so a
/// trailing finish marker can be stripped before it is ever visible.
pub const LOOKAHEAD_CHARS: usize = FINISHED_TOKEN.len() + 4;

/// Finish reason used on the synthetic terminal event when retries are
/// exhausted. Deliberately non-standard so clients can tell it apart from
/// anything the upstream would produce.
pub const EXHAUSTED_FINISH_REASON: &str = "FXXKED";

// ---------------------------------------------------------------------------
// Injected prompt blocks
// ---------------------------------------------------------------------------

/// Separator glued between the operator's own system instruction and the
/// protocol blocks appended by the proxy.
pub const PROMPT_SEPARATOR: &str = "\n\n---\n";

/// Demands the begin marker as the first bytes of the formal answer.
pub const OUTPUT_START_PROTOCOL: &str = "\
## Output Start Protocol

When you have finished your internal reasoning and are ready to give the \
formal answer, you MUST output the marker token [RESPONSE_BEGIN] \
immediately before the first character of the formal answer.

Rules:
1. Output [RESPONSE_BEGIN] exactly once per response.
2. The marker must be the very first bytes of the formal answer: no \
greeting, no leading whitespace, nothing before it.
3. Never mention, quote, or explain the marker to the user.";

/// Demands the finish marker as the last bytes of the output.
pub const FINAL_OUTPUT_PROTOCOL: &str = "\
## Final Output Protocol

You MUST end every response with the marker token [RESPONSE_FINISHED].

Rules:
1. Output [RESPONSE_FINISHED] exactly once, as the very last bytes of \
your output.
2. The marker must appear outside of any code fence, table, or other \
markup.
3. Even when you have nothing further to say, still output the marker.
4. Never mention, quote, or explain the marker to the user.";

/// Short reminder glued onto the final user turn of every request.
pub const FINISH_REMINDER: &str = "\n\n(Reminder: end your response with \
[RESPONSE_FINISHED] once, when it is truly complete.)";

/// Instructs the model to resume a cut-off answer in place.
pub const RESUME_PROMPT: &str = "\
Your previous response was cut off before it was finished. Continue \
EXACTLY from the next character after the end of your previous message. \
Do not repeat any earlier content. Do not add any preamble, apology, or \
summary. Do not start over. When the answer is complete, append \
[RESPONSE_FINISHED].";

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Default budget for retryable upstream statuses and incomplete streams.
/// Overridable via `MAX_RETRIES`.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Budget for network-level faults (connect errors, resets).
pub const MAX_FETCH_RETRIES: u32 = 3;

/// Budget for HTTP error statuses outside the retryable set.
pub const MAX_NON_RETRYABLE_STATUS_RETRIES: u32 = 3;

/// Upstream statuses that draw on the full `MAX_RETRIES` budget.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[403, 429, 500, 503];

/// A 400 whose body mentions one of these is treated as retryable: the
/// upstream intermittently rejects valid keys and mislocates callers.
pub const RETRYABLE_400_MARKERS: &[&str] = &["api key", "user location"];

/// Body markers indicating a hard daily-quota rejection, for which a
/// backoff sleep is pointless.
pub const HARD_QUOTA_MARKERS: &[&str] = &[
    "\"quota_limit_value\":\"0\"",
    "GenerateRequestsPerDayPerProjectPerModel",
];

/// Backoff before retrying a soft (per-minute metric) 429, streaming mode.
pub const STREAM_QUOTA_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff before retrying a soft 429, non-streaming mode.
pub const UNARY_QUOTA_BACKOFF: Duration = Duration::from_millis(500);

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// 400 bodies that are really transient upstream flakiness.
pub fn is_effectively_retryable_400(body: &str) -> bool {
    let lower = body.to_lowercase();
    RETRYABLE_400_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn is_hard_quota_failure(body: &str) -> bool {
    HARD_QUOTA_MARKERS.iter().any(|m| body.contains(m))
}

// ---------------------------------------------------------------------------
// Stream timing
// ---------------------------------------------------------------------------

/// Inactivity timeout before the first upstream chunk of an attempt.
pub const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(20);

/// Inactivity timeout between subsequent upstream chunks.
pub const CHUNK_GAP_TIMEOUT: Duration = Duration::from_secs(4);

/// Interval between keep-alive events emitted to the client while the
/// response is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Payload guards
// ---------------------------------------------------------------------------

/// Reject any single event payload larger than this before JSON parsing.
pub const MAX_EVENT_JSON_BYTES: usize = 100 * 1024;

/// Cap on concatenated response text extracted from one event.
pub const MAX_EVENT_TEXT_BYTES: usize = 50 * 1024;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// User-Agent sent on every upstream request.
pub const PROXY_USER_AGENT: &str = "restitch/0.1";

/// Clients whose User-Agent contains this marker hide reasoning content
/// client-side; keep-alive events sent to them must not carry a thought
/// flag or they render as a perpetually-open reasoning block.
pub const THOUGHT_HIDING_UA_MARKER: &str = "CherryStudio";

// ---------------------------------------------------------------------------
// Model classes
// ---------------------------------------------------------------------------

/// Model families the sentinel protocol is applied to. Requests for any
/// other model bypass the engine entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Pro,
    Flash,
    FlashLite,
}

impl ModelClass {
    /// Detect the model class from a request path. Longest names are
    /// matched first so `flash-lite` is not mistaken for `flash`.
    pub fn from_path(path: &str) -> Option<Self> {
        if path.contains("gemini-2.5-flash-lite") {
            Some(Self::FlashLite)
        } else if path.contains("gemini-2.5-flash") {
            Some(Self::Flash)
        } else if path.contains("gemini-2.5-pro") {
            Some(Self::Pro)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pro => "gemini-2.5-pro",
            Self::Flash => "gemini-2.5-flash",
            Self::FlashLite => "gemini-2.5-flash-lite",
        }
    }

    /// Whether a completed answer from this class must carry the finish
    /// marker. The lite class ignores the protocol often enough that
    /// requiring it would retry forever.
    pub fn requires_finish_token(&self) -> bool {
        !matches!(self, Self::FlashLite)
    }

    /// Whether this class produces a reasoning phase by default, and so
    /// gets the begin-marker prompt injected.
    pub fn thinks_by_default(&self) -> bool {
        !matches!(self, Self::FlashLite)
    }

    /// Inclusive clamp range for `thinkingConfig.thinkingBudget`.
    pub fn thinking_budget_range(&self) -> (i64, i64) {
        match self {
            Self::Pro => (128, 32_768),
            Self::Flash => (128, 24_576),
            Self::FlashLite => (512, 24_576),
        }
    }
}

/// Clamp range applied when the model name is not recognised.
pub const DEFAULT_THINKING_BUDGET_RANGE: (i64, i64) = (128, 32_768);
