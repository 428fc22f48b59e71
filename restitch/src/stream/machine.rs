// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Stream state machine.
//
// Classifies each upstream event into the thought or formal phase,
// detects the begin marker even when the model splits it across up to
// three events, recasts pre-marker text as reasoning, and drives the
// lookahead forwarder. Any function-call part flips the machine into a
// sticky passthrough where bytes flow unmodified.

use serde_json::Value;

use super::codec::{
    self, extract_parts, make_event, strip_partial_finish, text_part, thought_part,
};
use super::forwarder::{BufferedLine, LookaheadForwarder};
use crate::protocol::{BEGIN_TOKEN, EXHAUSTED_FINISH_REASON, FINISHED_TOKEN, INCOMPLETE_TOKEN};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Processing phase for one upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reasoning phase: formal text has not started yet.
    Thought,
    /// Formal answer phase, after the begin marker (or from the start
    /// when no marker is expected).
    Formal,
    /// Sticky raw-forwarding mode entered on the first function call.
    Passthrough,
}

/// Why an attempt was abandoned mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The begin marker arrived as the very first output: the model
    /// skipped its reasoning stage and will usually produce a degraded
    /// answer. Restart the attempt.
    PrematureBegin,
    /// The reasoning prelude appeared twice: the model is looping
    /// instead of continuing. Re-anchor and restart.
    GhostLoop,
}

/// Something to send to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Serialise as one `data:` record.
    Event(Value),
    /// A non-data upstream line, forwarded untouched.
    Verbatim(String),
}

/// Result of ingesting one upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue(Vec<Emission>),
    /// Function call observed: emissions carry the flushed buffer and the
    /// triggering event; everything after is raw bytes.
    EnterPassthrough(Vec<Emission>),
    Abort(AbortReason),
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StreamMachine {
    phase: Phase,
    expect_begin: bool,
    include_thoughts: bool,
    prelude: String,
    forwarder: LookaheadForwarder,
    /// Any reasoning frame seen this attempt, even if dropped.
    saw_thought: bool,
    has_begin: bool,
    /// Most recent structurally valid upstream event; metadata template
    /// for synthesised terminal events.
    template: Option<Value>,
}

impl StreamMachine {
    pub fn new(expect_begin: bool, include_thoughts: bool, prelude: &str) -> Self {
        Self {
            phase: if expect_begin { Phase::Thought } else { Phase::Formal },
            expect_begin,
            include_thoughts,
            prelude: prelude.to_string(),
            forwarder: LookaheadForwarder::new(),
            saw_thought: false,
            has_begin: false,
            template: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn has_begin_token(&self) -> bool {
        self.has_begin
    }

    /// Formal text the client has already received this attempt.
    pub fn delivered_text(&self) -> &str {
        self.forwarder.delivered_text()
    }

    pub fn template(&self) -> Option<&Value> {
        self.template.as_ref()
    }

    /// Seed the metadata template from a previous attempt, so a retry
    /// that dies before its first event can still finalise properly.
    pub fn set_template(&mut self, template: Option<Value>) {
        self.template = template;
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Ingest one parsed upstream event.
    pub fn on_event(&mut self, event: Value) -> StepOutcome {
        let parts = extract_parts(&event);

        if parts.has_function_call {
            return self.enter_passthrough(event);
        }

        if event.pointer("/candidates/0").is_some() {
            self.template = Some(event.clone());
        }

        if parts.has_thought {
            self.saw_thought = true;
        }

        // Reasoning frames are never forwarded individually: the client
        // sees reasoning once, recast onto the phase transition. Frames
        // with no answer text carry nothing else the buffers need.
        if parts.response_text.is_empty() {
            return StepOutcome::Continue(Vec::new());
        }

        if self.phase == Phase::Thought {
            if let Some((prefix, suffix)) = self.find_transition(&parts.response_text) {
                if prefix.is_empty() && !self.saw_thought {
                    return StepOutcome::Abort(AbortReason::PrematureBegin);
                }
                return self.transition(event, prefix, suffix);
            }
            // Not (yet) the transition: hold as a begin candidate.
            self.forwarder.push(BufferedLine {
                template: event,
                thought: None,
                text: parts.response_text,
            });
            if self.ghost_looped() {
                return StepOutcome::Abort(AbortReason::GhostLoop);
            }
            return StepOutcome::Continue(Vec::new());
        }

        self.forwarder.push(BufferedLine {
            template: event,
            thought: None,
            text: parts.response_text,
        });
        // Abort before draining: an aborted attempt must not mark
        // buffered text as delivered.
        if self.ghost_looped() {
            return StepOutcome::Abort(AbortReason::GhostLoop);
        }
        StepOutcome::Continue(self.drain())
    }

    // -----------------------------------------------------------------------
    // Begin-marker detection
    // -----------------------------------------------------------------------

    /// Look for the begin marker in the tail of the buffered text plus the
    /// incoming fragment. The marker can be split across up to three
    /// events, so the match window covers the two most recent buffered
    /// fragments; anything older can no longer complete a marker.
    ///
    /// A marker directly preceded by a backtick is inside a code fence the
    /// model is quoting, not the real transition; scanning continues past
    /// it.
    fn find_transition(&self, incoming: &str) -> Option<(String, String)> {
        let pending = self.forwarder.pending_text();
        let mut total = pending;
        total.push_str(incoming);

        let window_len: usize = self
            .forwarder
            .recent_texts(2)
            .iter()
            .map(|t| t.len())
            .sum::<usize>()
            + incoming.len();
        let search_start = total.len() - window_len;

        let mut from = search_start;
        while let Some(found) = total[from..].find(BEGIN_TOKEN) {
            let at = from + found;
            let fenced = at > 0 && total.as_bytes()[at - 1] == b'`';
            if !fenced {
                let prefix = total[..at].to_string();
                let suffix = total[at + BEGIN_TOKEN.len()..].to_string();
                return Some((prefix, suffix));
            }
            from = at + 1;
        }
        None
    }

    fn transition(&mut self, event: Value, prefix: String, suffix: String) -> StepOutcome {
        // Everything buffered was consumed into the reasoning prefix.
        let _ = self.forwarder.take_all();

        self.has_begin = true;
        self.phase = Phase::Formal;

        let thought = if self.include_thoughts && !prefix.is_empty() {
            Some(prefix)
        } else {
            None
        };
        self.forwarder.push(BufferedLine {
            template: event,
            thought,
            text: suffix,
        });

        if self.ghost_looped() {
            return StepOutcome::Abort(AbortReason::GhostLoop);
        }
        StepOutcome::Continue(self.drain())
    }

    // -----------------------------------------------------------------------
    // Ghost-loop detection
    // -----------------------------------------------------------------------

    /// The model has ghost-looped when its reasoning prelude shows up
    /// twice in what the client has seen plus what is still buffered.
    fn ghost_looped(&self) -> bool {
        if self.prelude.is_empty() {
            return false;
        }
        let mut combined = self.forwarder.delivered_text().to_string();
        combined.push_str(&self.forwarder.pending_text());
        combined.matches(&self.prelude).count() >= 2
    }

    // -----------------------------------------------------------------------
    // Passthrough
    // -----------------------------------------------------------------------

    fn enter_passthrough(&mut self, event: Value) -> StepOutcome {
        let mut lines = self.forwarder.take_all();

        // An in-flight finish marker must not leak into the flushed text.
        if let Some(last) = lines.last_mut() {
            last.text = codec::scrub_markers(strip_partial_finish(&last.text));
        }

        let mut emissions: Vec<Emission> = Vec::new();
        for line in lines {
            if line.text.is_empty() && line.thought.is_none() {
                continue;
            }
            self.forwarder.note_delivered(&line.text);
            emissions.push(Emission::Event(self.line_event(line)));
        }

        // The triggering event goes out exactly as the upstream sent it.
        emissions.push(Emission::Event(event.clone()));
        self.template = Some(event);
        self.phase = Phase::Passthrough;
        StepOutcome::EnterPassthrough(emissions)
    }

    // -----------------------------------------------------------------------
    // Draining and finalisation
    // -----------------------------------------------------------------------

    fn drain(&mut self) -> Vec<Emission> {
        self.forwarder
            .drain_ready()
            .into_iter()
            .map(|line| Emission::Event(self.line_event(line)))
            .collect()
    }

    fn line_event(&self, line: BufferedLine) -> Value {
        let mut parts = Vec::new();
        if let Some(thought) = &line.thought {
            parts.push(thought_part(thought));
        }
        parts.push(text_part(&line.text));
        make_event(Some(&line.template), parts, None)
    }

    /// Whether this attempt's output constitutes a complete answer.
    pub fn is_complete(&self, requires_finish: bool) -> bool {
        if self.expect_begin && !self.has_begin {
            return false;
        }
        if !requires_finish {
            return true;
        }
        let mut formal = self.forwarder.delivered_text().to_string();
        formal.push_str(&self.forwarder.pending_text());
        formal.trim_end().ends_with(FINISHED_TOKEN)
    }

    /// Collapse the residual buffer into the terminal success event:
    /// reasoning and answer texts concatenated separately, the finish
    /// marker stripped, upstream metadata carried from the template.
    pub fn finalize_success(&mut self) -> Emission {
        let lines = self.forwarder.take_all();

        let mut thought = String::new();
        let mut formal = String::new();
        for line in lines {
            if let Some(t) = line.thought {
                thought.push_str(&t);
            }
            formal.push_str(&line.text);
        }

        let cleaned = codec::scrub_markers(&codec::clean_final_text(&formal));
        self.forwarder.note_delivered(&cleaned);

        let mut parts = Vec::new();
        if !thought.is_empty() {
            parts.push(thought_part(&thought));
        }
        parts.push(text_part(&cleaned));
        Emission::Event(make_event(self.template.as_ref(), parts, Some("STOP")))
    }

    /// Retry budget exhausted: flush the residue unchanged, then append
    /// the incomplete marker on a synthetic terminal event.
    pub fn finalize_exhausted(&mut self) -> Vec<Emission> {
        let lines = self.forwarder.take_all();

        let mut out: Vec<Emission> = Vec::new();
        for line in lines {
            if line.text.is_empty() && line.thought.is_none() {
                continue;
            }
            self.forwarder.note_delivered(&line.text);
            out.push(Emission::Event(self.line_event(line)));
        }

        let marker = format!("\n{INCOMPLETE_TOKEN}");
        out.push(Emission::Event(make_event(
            self.template.as_ref(),
            vec![text_part(&marker)],
            Some(EXHAUSTED_FINISH_REASON),
        )));
        out
    }
}
