// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Lookahead forwarder.
//
// Formal-answer text is released to the client in whole-event units, but
// only once it is clear of the withheld tail: the last `LOOKAHEAD_CHARS`
// characters stay buffered at all times, so a finish marker arriving at
// the end of the stream can be stripped before anything the client sees.
// Counting is in characters, not bytes; the withheld tail must survive
// multi-byte text.

use std::collections::VecDeque;

use serde_json::Value;

use super::codec::scrub_markers;
use crate::protocol::LOOKAHEAD_CHARS;

/// One not-yet-released event worth of formal text.
#[derive(Debug, Clone)]
pub struct BufferedLine {
    /// Upstream event this line was cut from; reused as the metadata
    /// template when the line is re-serialised.
    pub template: Value,
    /// Reasoning prefix recast onto this line by the phase transition.
    pub thought: Option<String>,
    /// Formal text accounted against the lookahead window.
    pub text: String,
}

#[derive(Debug)]
pub struct LookaheadForwarder {
    window: usize,
    lines: VecDeque<BufferedLine>,
    /// Characters across all buffered line texts.
    pending_chars: usize,
    /// Formal text already released to the client this attempt, as the
    /// client saw it (markers scrubbed).
    delivered: String,
}

impl LookaheadForwarder {
    pub fn new() -> Self {
        Self::with_window(LOOKAHEAD_CHARS)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window,
            lines: VecDeque::new(),
            pending_chars: 0,
            delivered: String::new(),
        }
    }

    pub fn push(&mut self, line: BufferedLine) {
        self.pending_chars += line.text.chars().count();
        self.lines.push_back(line);
    }

    /// Release every head line that fits outside the withheld tail.
    ///
    /// A line is safe once its full text lies clear of the last `window`
    /// characters of buffered text. Lines are never split: when the head
    /// does not fully fit, draining stops.
    pub fn drain_ready(&mut self) -> Vec<BufferedLine> {
        let mut out = Vec::new();
        while self.pending_chars > self.window {
            let Some(head) = self.lines.front() else {
                break;
            };
            let head_chars = head.text.chars().count();
            if head_chars > self.pending_chars - self.window {
                break;
            }
            let mut line = self.lines.pop_front().expect("head exists");
            self.pending_chars -= head_chars;
            line.text = scrub_markers(&line.text);
            self.delivered.push_str(&line.text);
            out.push(line);
        }
        out
    }

    /// Take everything still buffered, in order. Used by the phase
    /// transition, the function-call flush, and both finalisers.
    pub fn take_all(&mut self) -> Vec<BufferedLine> {
        self.pending_chars = 0;
        self.lines.drain(..).collect()
    }

    /// Concatenation of all buffered line texts.
    pub fn pending_text(&self) -> String {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }

    /// Texts of up to the `n` most recent buffered lines, oldest first.
    pub fn recent_texts(&self, n: usize) -> Vec<&str> {
        let len = self.lines.len();
        self.lines
            .iter()
            .skip(len.saturating_sub(n))
            .map(|l| l.text.as_str())
            .collect()
    }

    pub fn delivered_text(&self) -> &str {
        &self.delivered
    }

    /// Record text released outside the drain path (terminal events).
    pub fn note_delivered(&mut self, text: &str) {
        self.delivered.push_str(text);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for LookaheadForwarder {
    fn default() -> Self {
        Self::new()
    }
}
