// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Stream pipeline for the sentinel protocol.
//
// Responsibilities:
// - Decode upstream SSE bytes into events (partial lines across TCP
//   chunks handled)
// - Classify each event into the thought / formal / passthrough phases
// - Detect the begin marker even when split across up to three events
// - Withhold a lookahead window of formal text so the finish marker can
//   always be stripped before it reaches the client
// - Flip to raw passthrough on the first function-call part

mod codec;
mod forwarder;
mod machine;

pub use codec::{
    clean_final_text, encode_data_event, extract_parts, make_event, parse_data_payload,
    scrub_markers, text_part, thought_part, ExtractedParts, SseDecoder, SseFrame,
};
pub use forwarder::{BufferedLine, LookaheadForwarder};
pub use machine::{AbortReason, Emission, Phase, StepOutcome, StreamMachine};

#[cfg(test)]
mod tests;
