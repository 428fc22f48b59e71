// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Runtime configuration, read once from the environment at startup.
//
// Everything here varies by deployment, never by request. Retry budgets
// that are protocol constants (fetch faults, non-retryable statuses)
// live in `protocol.rs`; only the knobs an operator is expected to turn
// are surfaced as environment variables.

use crate::protocol;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("UPSTREAM_URL_BASE is required")]
    MissingUpstreamBase,

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Parsed and validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream API origin, e.g. `https://generativelanguage.googleapis.com`.
    /// Stored without a trailing slash.
    pub upstream_base: String,
    /// Budget for retryable statuses and incomplete streams.
    pub max_retries: u32,
    /// Statuses that abort a request immediately instead of retrying.
    /// Empty by default: every non-success is retried up to its class's
    /// budget. (An earlier deployment listed 500 here; that turned out to
    /// retry-starve transient upstream hiccups, so the default is empty.)
    pub fatal_status_codes: Vec<u16>,
    /// The fixed prefix the model emits at the start of its reasoning.
    /// Used to detect repetition loops and to re-anchor continuations.
    pub thought_prelude: String,
    /// Verbose logging toggle.
    pub debug: bool,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// - `UPSTREAM_URL_BASE` (required)
    /// - `MAX_RETRIES` (default 100)
    /// - `FATAL_STATUS_CODES` (comma-separated, default empty)
    /// - `THOUGHT_PRELUDE` (default "Thinking Process:")
    /// - `DEBUG_MODE` (default true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream_base = std::env::var("UPSTREAM_URL_BASE")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingUpstreamBase)?
            .trim_end_matches('/')
            .to_string();

        let max_retries = match std::env::var("MAX_RETRIES") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAX_RETRIES",
                value: v,
            })?,
            Err(_) => protocol::DEFAULT_MAX_RETRIES,
        };

        let fatal_status_codes = match std::env::var("FATAL_STATUS_CODES") {
            Ok(v) => parse_status_list(&v).ok_or(ConfigError::InvalidValue {
                key: "FATAL_STATUS_CODES",
                value: v,
            })?,
            Err(_) => Vec::new(),
        };

        let thought_prelude = std::env::var("THOUGHT_PRELUDE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_THOUGHT_PRELUDE.to_string());

        let debug = match std::env::var("DEBUG_MODE") {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::InvalidValue {
                key: "DEBUG_MODE",
                value: v,
            })?,
            Err(_) => true,
        };

        Ok(Self {
            upstream_base,
            max_retries,
            fatal_status_codes,
            thought_prelude,
            debug,
        })
    }

    pub fn is_fatal_status(&self, status: u16) -> bool {
        self.fatal_status_codes.contains(&status)
    }
}

/// Default reasoning prefix. Operators running a custom prompt kit set
/// `THOUGHT_PRELUDE` to match whatever prefix their kit makes the model
/// emit.
pub const DEFAULT_THOUGHT_PRELUDE: &str = "Thinking Process:";

fn parse_status_list(raw: &str) -> Option<Vec<u16>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split(',')
        .map(|s| s.trim().parse::<u16>().ok())
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
