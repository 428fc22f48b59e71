// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Tests for the stream pipeline: SSE decoding, lookahead forwarding,
// phase transitions, split begin markers, the backtick guard, ghost
// loops, and the function-call escape hatch.

use super::*;
use crate::protocol::{BEGIN_TOKEN, FINISHED_TOKEN, INCOMPLETE_TOKEN, LOOKAHEAD_CHARS};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn data_event(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }], "role": "model" },
            "index": 0
        }]
    })
}

fn thought_event(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text, "thought": true }], "role": "model" },
            "index": 0
        }]
    })
}

fn function_call_event(name: &str) -> Value {
    json!({
        "candidates": [{
            "content": {
                "parts": [{ "functionCall": { "name": name, "args": {} } }],
                "role": "model"
            },
            "index": 0
        }]
    })
}

/// Feed events through a machine, panicking on aborts, and collect every
/// emitted event value.
fn collect_events(machine: &mut StreamMachine, texts: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for event in texts {
        match machine.on_event(event.clone()) {
            StepOutcome::Continue(emissions) | StepOutcome::EnterPassthrough(emissions) => {
                for emission in emissions {
                    if let Emission::Event(v) = emission {
                        out.push(v);
                    }
                }
            }
            StepOutcome::Abort(reason) => panic!("unexpected abort: {reason:?}"),
        }
    }
    out
}

fn event_text(event: &Value) -> String {
    event
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("thought").and_then(Value::as_bool) != Some(true))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn event_thought(event: &Value) -> String {
    event
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("thought").and_then(Value::as_bool) == Some(true))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

const PRELUDE: &str = "Thinking Process:";

fn thinking_machine() -> StreamMachine {
    StreamMachine::new(true, true, PRELUDE)
}

fn plain_machine() -> StreamMachine {
    StreamMachine::new(false, false, PRELUDE)
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

fn data_frame(payload: &str) -> SseFrame {
    SseFrame::Data {
        raw: format!("data: {payload}"),
        payload: payload.to_string(),
    }
}

#[test]
fn decoder_joins_partial_lines_across_chunks() {
    let mut decoder = SseDecoder::new();
    assert!(decoder.feed(b"data: {\"a\":").is_empty());
    let frames = decoder.feed(b"1}\n");
    assert_eq!(frames, vec![data_frame("{\"a\":1}")]);
}

#[test]
fn decoder_emits_multiple_lines_from_one_chunk() {
    let mut decoder = SseDecoder::new();
    let frames = decoder.feed(b"data: one\n\ndata: two\n");
    assert_eq!(
        frames,
        vec![
            data_frame("one"),
            SseFrame::Verbatim(String::new()),
            data_frame("two"),
        ]
    );
}

#[test]
fn decoder_strips_carriage_returns() {
    let mut decoder = SseDecoder::new();
    let frames = decoder.feed(b"data: x\r\n\r\n");
    assert_eq!(
        frames,
        vec![data_frame("x"), SseFrame::Verbatim(String::new())]
    );
}

#[test]
fn decoder_survives_multibyte_split() {
    // "é" = 0xC3 0xA9, split across chunks inside one line.
    let mut decoder = SseDecoder::new();
    assert!(decoder.feed(b"data: caf\xC3").is_empty());
    let frames = decoder.feed(b"\xA9\n");
    assert_eq!(frames, vec![data_frame("café")]);
}

#[test]
fn decoder_finish_yields_unterminated_tail() {
    let mut decoder = SseDecoder::new();
    assert!(decoder.feed(b"data: tail-no-newline").is_empty());
    assert_eq!(decoder.finish(), Some(data_frame("tail-no-newline")));
    assert_eq!(decoder.finish(), None);
}

#[test]
fn comment_lines_are_verbatim() {
    let mut decoder = SseDecoder::new();
    let frames = decoder.feed(b": keep-alive\n");
    assert_eq!(frames, vec![SseFrame::Verbatim(": keep-alive".to_string())]);
}

// ---------------------------------------------------------------------------
// Payload parsing and part extraction
// ---------------------------------------------------------------------------

#[test]
fn oversized_payload_rejected() {
    let huge = format!("{{\"pad\":\"{}\"}}", "x".repeat(101 * 1024));
    assert!(parse_data_payload(&huge).is_none());
    assert!(parse_data_payload("{\"ok\":true}").is_some());
    assert!(parse_data_payload("not json").is_none());
}

#[test]
fn parts_separated_by_kind() {
    let event = json!({
        "candidates": [{
            "content": {
                "parts": [
                    { "text": "mulling", "thought": true },
                    { "text": "answer " },
                    { "text": "text" },
                    { "functionCall": { "name": "f", "args": {} } }
                ],
                "role": "model"
            }
        }]
    });
    let parts = extract_parts(&event);
    assert_eq!(parts.thought_text, "mulling");
    assert_eq!(parts.response_text, "answer text");
    assert!(parts.has_thought);
    assert!(parts.has_function_call);
}

#[test]
fn response_text_capped_per_event() {
    let event = data_event(&"y".repeat(60 * 1024));
    let parts = extract_parts(&event);
    assert_eq!(parts.response_text.len(), 50 * 1024);
}

// ---------------------------------------------------------------------------
// Text cleanup
// ---------------------------------------------------------------------------

#[test]
fn clean_final_text_strips_trailing_marker() {
    let body = format!("  the answer{FINISHED_TOKEN}");
    assert_eq!(clean_final_text(&body), "  the answer");

    let spaced = format!("the answer \n {FINISHED_TOKEN} \n");
    assert_eq!(clean_final_text(&spaced), "the answer");

    assert_eq!(clean_final_text("no marker here"), "no marker here");
}

#[test]
fn clean_final_text_round_trip() {
    for s in ["plain", "  leading spaces kept", "multi\nline\nanswer"] {
        let with_marker = format!("{s}{FINISHED_TOKEN}");
        assert_eq!(clean_final_text(&with_marker), s);
    }
}

#[test]
fn scrub_removes_every_marker() {
    let text = format!("a{BEGIN_TOKEN}b{FINISHED_TOKEN}c{FINISHED_TOKEN}");
    assert_eq!(scrub_markers(&text), "abc");
    assert_eq!(scrub_markers("untouched"), "untouched");
}

// ---------------------------------------------------------------------------
// Lookahead forwarder
// ---------------------------------------------------------------------------

fn line(text: &str) -> BufferedLine {
    BufferedLine {
        template: data_event(text),
        thought: None,
        text: text.to_string(),
    }
}

#[test]
fn forwarder_withholds_tail_window() {
    let mut fwd = LookaheadForwarder::new();
    fwd.push(line("short"));
    // 5 chars total, all inside the window: nothing may leave.
    assert!(fwd.drain_ready().is_empty());
    assert_eq!(fwd.pending_text(), "short");
}

#[test]
fn forwarder_releases_head_once_clear_of_window() {
    let mut fwd = LookaheadForwarder::new();
    fwd.push(line("hello"));
    fwd.push(line(&"x".repeat(LOOKAHEAD_CHARS)));
    // 5 + 25 pending; "hello" fits within pending - window = 5.
    let released = fwd.drain_ready();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].text, "hello");
    assert_eq!(fwd.delivered_text(), "hello");
    assert_eq!(fwd.pending_text(), "x".repeat(LOOKAHEAD_CHARS));
}

#[test]
fn forwarder_never_splits_a_line() {
    let mut fwd = LookaheadForwarder::new();
    fwd.push(line(&"a".repeat(30)));
    // 30 pending, 5 releasable, but the head needs all 30: hold it.
    assert!(fwd.drain_ready().is_empty());

    fwd.push(line(&"b".repeat(30)));
    // 60 pending, 35 releasable: the 30-char head fits now.
    let released = fwd.drain_ready();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].text, "a".repeat(30));
}

#[test]
fn forwarder_counts_characters_not_bytes() {
    let mut fwd = LookaheadForwarder::new();
    fwd.push(line("héllo"));
    fwd.push(line(&"€".repeat(LOOKAHEAD_CHARS)));
    let released = fwd.drain_ready();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].text, "héllo");
}

#[test]
fn emitted_stream_never_contains_finish_marker() {
    let mut fwd = LookaheadForwarder::new();
    fwd.push(line("begin of answer, "));
    fwd.push(line("middle of answer, "));
    fwd.push(line(&format!("end{FINISHED_TOKEN}")));
    let released = fwd.drain_ready();
    let emitted: String = released.iter().map(|l| l.text.as_str()).collect();
    assert!(!emitted.contains(FINISHED_TOKEN));
    // The marker is still inside the withheld tail.
    assert!(fwd.pending_text().contains(FINISHED_TOKEN));
}

// ---------------------------------------------------------------------------
// Machine: happy path
// ---------------------------------------------------------------------------

#[test]
fn happy_path_thought_then_formal_then_terminal() {
    let mut machine = thinking_machine();

    let events = vec![
        thought_event("let me think about this"),
        data_event(&format!("{BEGIN_TOKEN}first part ")),
        data_event("second part of the answer "),
        data_event(&format!("done.{FINISHED_TOKEN}")),
    ];
    let emitted = collect_events(&mut machine, &events);

    // The transition line drained once enough text followed it.
    assert!(!emitted.is_empty());
    assert!(machine.has_begin_token());
    assert_eq!(machine.phase(), Phase::Formal);
    assert!(machine.is_complete(true));

    let Emission::Event(terminal) = machine.finalize_success() else {
        panic!("expected terminal event");
    };
    assert_eq!(
        terminal.pointer("/candidates/0/finishReason"),
        Some(&json!("STOP"))
    );

    let mut full = emitted.iter().map(event_text).collect::<String>();
    full.push_str(&event_text(&terminal));
    assert_eq!(full, "first part second part of the answer done.");
    assert!(!full.contains(FINISHED_TOKEN));
    assert!(!full.contains(BEGIN_TOKEN));
}

#[test]
fn garbage_thought_frames_dropped() {
    let mut machine = thinking_machine();
    match machine.on_event(thought_event("pondering...")) {
        StepOutcome::Continue(emissions) => assert!(emissions.is_empty()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn without_begin_expectation_machine_starts_formal() {
    let mut machine = plain_machine();
    assert_eq!(machine.phase(), Phase::Formal);

    let filler = "plenty of text to push the head line clear of the window";
    let emitted = collect_events(
        &mut machine,
        &[data_event("first chunk "), data_event(filler)],
    );
    assert_eq!(event_text(&emitted[0]), "first chunk ");
}

// ---------------------------------------------------------------------------
// Machine: split begin marker
// ---------------------------------------------------------------------------

#[test]
fn begin_split_across_two_events() {
    let mut machine = thinking_machine();
    let events = vec![
        data_event("...thinking...[RESPONSE_"),
        data_event("BEGIN]hello"),
        data_event(&format!(" world{FINISHED_TOKEN}")),
    ];
    let emitted = collect_events(&mut machine, &events);
    assert!(machine.has_begin_token());

    let Emission::Event(terminal) = machine.finalize_success() else {
        panic!("expected terminal event");
    };
    let mut formal = emitted.iter().map(event_text).collect::<String>();
    formal.push_str(&event_text(&terminal));
    assert_eq!(formal, "hello world");

    let thought: String = emitted
        .iter()
        .map(event_thought)
        .chain(std::iter::once(event_thought(&terminal)))
        .collect();
    assert_eq!(thought, "...thinking...");
}

#[test]
fn begin_split_across_three_events() {
    let mut machine = thinking_machine();
    let events = vec![
        data_event("mulling [RE"),
        data_event("SPONSE_BE"),
        data_event("GIN]the answer starts here and runs on for a while"),
    ];
    let _ = collect_events(&mut machine, &events);
    assert!(machine.has_begin_token());
    assert_eq!(machine.phase(), Phase::Formal);
}

#[test]
fn backtick_guard_rejects_fenced_marker() {
    let mut machine = thinking_machine();
    let events = vec![data_event(&format!("```{BEGIN_TOKEN}"))];
    let _ = collect_events(&mut machine, &events);
    assert!(!machine.has_begin_token());
    assert_eq!(machine.phase(), Phase::Thought);
}

#[test]
fn backtick_guard_respects_fragment_boundary() {
    // The backtick arrives in one event, the marker in the next; the
    // guard must still see them as adjacent.
    let mut machine = thinking_machine();
    let events = vec![
        data_event("look: ```"),
        data_event(&format!("{BEGIN_TOKEN}quoted")),
    ];
    let _ = collect_events(&mut machine, &events);
    assert!(!machine.has_begin_token());
}

#[test]
fn real_marker_after_fenced_one_is_found() {
    let mut machine = thinking_machine();
    let text = format!("`{BEGIN_TOKEN} is the marker; now{BEGIN_TOKEN}go");
    match machine.on_event(data_event(&text)) {
        StepOutcome::Continue(_) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(machine.has_begin_token());
}

// ---------------------------------------------------------------------------
// Machine: aborts
// ---------------------------------------------------------------------------

#[test]
fn premature_begin_aborts_attempt() {
    let mut machine = thinking_machine();
    let outcome = machine.on_event(data_event(&format!("{BEGIN_TOKEN}skipped thinking")));
    assert_eq!(outcome, StepOutcome::Abort(AbortReason::PrematureBegin));
}

#[test]
fn begin_after_thought_is_not_premature() {
    let mut machine = thinking_machine();
    let _ = machine.on_event(thought_event("considered it"));
    match machine.on_event(data_event(&format!("{BEGIN_TOKEN}the answer"))) {
        StepOutcome::Continue(_) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(machine.has_begin_token());
}

#[test]
fn ghost_loop_detected_on_second_prelude() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event(&format!("{PRELUDE} first pass at the problem. ")));
    let outcome = machine.on_event(data_event(&format!("{PRELUDE} second pass, looping. ")));
    assert_eq!(outcome, StepOutcome::Abort(AbortReason::GhostLoop));
}

#[test]
fn single_prelude_is_fine() {
    let mut machine = plain_machine();
    match machine.on_event(data_event(&format!("{PRELUDE} once only"))) {
        StepOutcome::Continue(_) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Machine: function calls
// ---------------------------------------------------------------------------

#[test]
fn function_call_flushes_buffer_and_enters_passthrough() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event("text before the call"));

    let outcome = machine.on_event(function_call_event("lookup"));
    let StepOutcome::EnterPassthrough(emissions) = outcome else {
        panic!("expected passthrough");
    };
    assert_eq!(machine.phase(), Phase::Passthrough);

    // Buffered text flushed first, then the triggering event untouched.
    let events: Vec<&Value> = emissions
        .iter()
        .filter_map(|e| match e {
            Emission::Event(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(event_text(events[0]), "text before the call");
    assert!(events[1]
        .pointer("/candidates/0/content/parts/0/functionCall")
        .is_some());
}

#[test]
fn function_call_flush_strips_partial_marker() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event("answer text [RESPONSE_FIN"));

    let StepOutcome::EnterPassthrough(emissions) = machine.on_event(function_call_event("f"))
    else {
        panic!("expected passthrough");
    };
    let Emission::Event(first) = &emissions[0] else {
        panic!("expected event");
    };
    assert_eq!(event_text(first), "answer text ");
}

// ---------------------------------------------------------------------------
// Machine: completion and finalisation
// ---------------------------------------------------------------------------

#[test]
fn completion_requires_begin_when_expected() {
    let mut machine = thinking_machine();
    let _ = machine.on_event(data_event(&format!("no begin yet{FINISHED_TOKEN}")));
    assert!(!machine.is_complete(true));
}

#[test]
fn completion_requires_finish_marker_unless_exempt() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event("an answer with no marker"));
    assert!(!machine.is_complete(true));
    // The lite class does not require the marker.
    assert!(machine.is_complete(false));
}

#[test]
fn finish_marker_inside_withheld_tail_counts() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event(&format!("short{FINISHED_TOKEN}")));
    assert!(machine.is_complete(true));
}

#[test]
fn finalize_preserves_template_metadata() {
    let mut machine = plain_machine();
    let mut event = data_event(&format!("answer{FINISHED_TOKEN}"));
    event["modelVersion"] = json!("gemini-2.5-pro-001");
    let _ = machine.on_event(event);

    let Emission::Event(terminal) = machine.finalize_success() else {
        panic!("expected terminal event");
    };
    assert_eq!(terminal["modelVersion"], "gemini-2.5-pro-001");
    assert_eq!(event_text(&terminal), "answer");
}

#[test]
fn exhausted_flush_appends_incomplete_marker() {
    let mut machine = plain_machine();
    let _ = machine.on_event(data_event("half an answ"));

    let emissions = machine.finalize_exhausted();
    let Emission::Event(last) = emissions.last().unwrap() else {
        panic!("expected event");
    };
    assert!(event_text(last).ends_with(INCOMPLETE_TOKEN));
    assert_eq!(
        last.pointer("/candidates/0/finishReason"),
        Some(&json!("FXXKED"))
    );
    // Residue flushed ahead of the marker, unchanged.
    let Emission::Event(first) = &emissions[0] else {
        panic!("expected event");
    };
    assert_eq!(event_text(first), "half an answ");
}

#[test]
fn delivered_text_tracks_client_view() {
    let mut machine = plain_machine();
    let filler = "x".repeat(LOOKAHEAD_CHARS);
    let _ = machine.on_event(data_event("visible part "));
    let _ = machine.on_event(data_event(&filler));
    assert_eq!(machine.delivered_text(), "visible part ");
}
