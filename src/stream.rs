//! Stream framing: translate upstream streaming bodies into Anthropic SSE
//! event sequences.
//!
//! The ordering invariant lives in one place, [`StreamFramer`]:
//!
//! ```text
//! message_start
//! content_block_start(index=0)
//! content_block_delta(index=0) × N≥0
//! content_block_stop(index=0)
//! message_delta(stop_reason=R)
//! message_stop
//! ```
//!
//! Upstream adapters push `text` and `finish` inputs into the framer and
//! never emit events themselves. Each adapter holds at most one partial
//! chunk buffer; nothing is buffered to completion.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

use crate::logging::SharedLogger;
use crate::translate::anthropic::{
    ContentBlock, Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, StreamEvent,
    Usage,
};
use crate::translate::gemini::{self, GenerateContentResponse};
use crate::translate::openai::{self, ChatCompletionChunk};

/// One SSE frame ready for emission to the client. `event` is absent for
/// data-only frames forwarded from an Anthropic upstream.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Stream of client-bound SSE frames. Upstream failures surface as `error`
/// event frames, not stream errors.
pub type SseStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;

fn event_frame(event: &StreamEvent) -> Option<SseFrame> {
    serde_json::to_string(event).ok().map(|data| SseFrame {
        event: Some(event.event_name().to_string()),
        data,
    })
}

// ---------------------------------------------------------------------------
// Framer state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Start,
    InBlock,
    Done,
}

/// Push-style state machine emitting the Anthropic event sequence.
///
/// `open` emits `message_start` + `content_block_start(0)`; `text` emits one
/// delta per call; `finish` closes block and message with the given (already
/// mapped) stop reason; `close` synthesizes an `end_turn` finish for streams
/// that end without a finish signal. All inputs after the stream is done are
/// ignored, which is what discards trailing upstream chunks.
#[derive(Debug)]
pub struct StreamFramer {
    model: String,
    message_id: String,
    state: FramerState,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamFramer {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: gemini::new_message_id(),
            state: FramerState::Start,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Record usage reported by the upstream; surfaced in `message_delta`.
    pub fn set_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
    }

    pub fn is_done(&self) -> bool {
        self.state == FramerState::Done
    }

    /// Emit the opening events. Idempotent.
    pub fn open(&mut self) -> Vec<StreamEvent> {
        if self.state != FramerState::Start {
            return Vec::new();
        }
        self.state = FramerState::InBlock;
        vec![
            StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: self.message_id.clone(),
                    response_type: "message".to_string(),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: self.input_tokens,
                        output_tokens: 0,
                    },
                },
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text {
                    text: String::new(),
                },
            },
        ]
    }

    pub fn text(&mut self, text: &str) -> Vec<StreamEvent> {
        if self.state == FramerState::Done {
            return Vec::new();
        }
        let mut events = self.open();
        events.push(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
        events
    }

    /// Close block and message. `stop_reason` is the Anthropic-side reason.
    pub fn finish(&mut self, stop_reason: &str) -> Vec<StreamEvent> {
        if self.state == FramerState::Done {
            return Vec::new();
        }
        let mut events = self.open();
        self.state = FramerState::Done;

        events.push(StreamEvent::ContentBlockStop { index: 0 });
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    /// Clean EOF without an upstream finish signal.
    pub fn close(&mut self) -> Vec<StreamEvent> {
        self.finish("end_turn")
    }

    /// Upstream read failure: emit an `error` event and stop.
    pub fn error(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.state == FramerState::Done {
            return Vec::new();
        }
        self.state = FramerState::Done;
        vec![StreamEvent::Error {
            error: ErrorBody {
                error_type: "api_error".to_string(),
                message: message.to_string(),
            },
        }]
    }
}

// ---------------------------------------------------------------------------
// OpenAI adapter
// ---------------------------------------------------------------------------

/// Translate an OpenAI SSE byte stream into Anthropic SSE frames.
///
/// Lines are `data: {...}` with a literal `data: [DONE]` sentinel. A chunk
/// carrying a finish_reason terminates the stream; trailing chunks are
/// dropped.
pub fn frame_openai_stream<S>(byte_stream: S, model: String, logger: SharedLogger) -> SseStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut framer = StreamFramer::new(&model);
        for event in framer.open() {
            if let Some(frame) = event_frame(&event) {
                yield frame;
            }
        }

        let mut buffer = String::new();
        tokio::pin!(byte_stream);

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("upstream read error: {e}"));
                    for event in framer.error("upstream read error") {
                        if let Some(frame) = event_frame(&event) {
                            yield frame;
                        }
                    }
                    break 'read;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer.drain(..=newline_pos);

                let Some(data) = line
                    .strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
                    .map(str::trim)
                else {
                    // Skip blank lines and non-data SSE fields.
                    continue;
                };

                if data == "[DONE]" {
                    break 'read;
                }

                let parsed: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        logger.debug("stream", format!("skipping unparseable chunk: {e}"));
                        continue;
                    }
                };

                if let Some(ref usage) = parsed.usage {
                    framer.set_usage(usage.prompt_tokens, usage.completion_tokens);
                }

                let Some(choice) = parsed.choices.first() else {
                    continue;
                };

                if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
                    for event in framer.text(content) {
                        if let Some(frame) = event_frame(&event) {
                            yield frame;
                        }
                    }
                }

                if let Some(ref reason) = choice.finish_reason {
                    for event in framer.finish(openai::map_finish_reason(reason)) {
                        if let Some(frame) = event_frame(&event) {
                            yield frame;
                        }
                    }
                    break 'read;
                }
            }
        }

        for event in framer.close() {
            if let Some(frame) = event_frame(&event) {
                yield frame;
            }
        }
        logger.debug("stream", "openai stream complete");
    })
}

// ---------------------------------------------------------------------------
// Gemini adapter
// ---------------------------------------------------------------------------

/// Translate a Gemini streaming body into Anthropic SSE frames.
///
/// The upstream may frame chunks as SSE `data:` lines or as one concatenated
/// JSON array; both reduce to scanning for complete top-level JSON objects.
pub fn frame_gemini_stream<S>(byte_stream: S, model: String, logger: SharedLogger) -> SseStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut framer = StreamFramer::new(&model);
        for event in framer.open() {
            if let Some(frame) = event_frame(&event) {
                yield frame;
            }
        }

        let mut scanner = JsonObjectScanner::new();
        tokio::pin!(byte_stream);

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("upstream read error: {e}"));
                    for event in framer.error("upstream read error") {
                        if let Some(frame) = event_frame(&event) {
                            yield frame;
                        }
                    }
                    break 'read;
                }
            };

            for object in scanner.push(&String::from_utf8_lossy(&chunk)) {
                let parsed: GenerateContentResponse = match serde_json::from_str(&object) {
                    Ok(p) => p,
                    Err(e) => {
                        logger.debug("stream", format!("skipping unparseable chunk: {e}"));
                        continue;
                    }
                };

                if let Some(ref usage) = parsed.usage_metadata {
                    framer.set_usage(usage.prompt_token_count, usage.candidates_token_count);
                }

                let Some(candidate) = parsed.candidates.first() else {
                    continue;
                };

                if let Some(ref content) = candidate.content {
                    for part in &content.parts {
                        if let crate::translate::gemini::Part::Text { text } = part {
                            if !text.is_empty() {
                                for event in framer.text(text) {
                                    if let Some(frame) = event_frame(&event) {
                                        yield frame;
                                    }
                                }
                            }
                        }
                    }
                }

                if let Some(reason) = candidate.finish_reason.as_deref().filter(|r| !r.is_empty()) {
                    for event in framer.finish(gemini::map_finish_reason(reason)) {
                        if let Some(frame) = event_frame(&event) {
                            yield frame;
                        }
                    }
                    break 'read;
                }
            }
        }

        for event in framer.close() {
            if let Some(frame) = event_frame(&event) {
                yield frame;
            }
        }
        logger.debug("stream", "gemini stream complete");
    })
}

// ---------------------------------------------------------------------------
// Anthropic passthrough adapter
// ---------------------------------------------------------------------------

/// Forward an Anthropic upstream SSE stream, re-emitting events with
/// normalized blank-line separators. Payloads are untouched.
pub fn frame_anthropic_stream<S>(byte_stream: S, logger: SharedLogger) -> SseStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut parser = SseParser::new();
        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("upstream read error: {e}"));
                    let event = StreamEvent::Error {
                        error: ErrorBody {
                            error_type: "api_error".to_string(),
                            message: "upstream read error".to_string(),
                        },
                    };
                    if let Some(frame) = event_frame(&event) {
                        yield frame;
                    }
                    return;
                }
            };

            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                yield SseFrame {
                    event: event.event,
                    data: event.data,
                };
            }
        }

        for event in parser.finish() {
            yield SseFrame {
                event: event.event,
                data: event.data,
            };
        }
        logger.debug("stream", "anthropic stream complete");
    })
}

// ---------------------------------------------------------------------------
// SSE parsing (passthrough path)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ParsedSseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser: accumulates `event:`/`data:` fields until the
/// blank-line terminator. Comments and unknown fields are dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<ParsedSseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.flush_event(&mut events);
            } else if line.starts_with(':') {
                // comment
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }

        events
    }

    pub fn finish(&mut self) -> Vec<ParsedSseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.flush_event(&mut events);
        events
    }

    fn flush_event(&mut self, events: &mut Vec<ParsedSseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(ParsedSseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

// ---------------------------------------------------------------------------
// JSON object scanning (Gemini path)
// ---------------------------------------------------------------------------

/// Scans a byte stream for complete JSON objects delimited by braces at
/// nesting depth 0, tolerating string literals and escapes. Array commas,
/// brackets, and SSE `data:` prefixes between objects are skipped, which is
/// what lets one scanner serve both Gemini framings.
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buf: String,
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    start: Option<usize>,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        let mut i = self.pos;
        while i < self.buf.len() {
            let b = self.buf.as_bytes()[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = Some(i);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            if let Some(start) = self.start.take() {
                                out.push(self.buf[start..=i].to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        self.pos = i;

        // Drop consumed input so the buffer stays bounded by one object.
        if self.depth == 0 {
            self.buf.clear();
            self.pos = 0;
        } else if let Some(start) = self.start {
            if start > 0 {
                self.buf.drain(..start);
                self.pos -= start;
                self.start = Some(0);
            }
        }

        out
    }
}
