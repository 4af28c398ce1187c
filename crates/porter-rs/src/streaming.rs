//! Streamed completions: byte-to-line reassembly and chunk translation.
//!
//! A streamed driver call answers with newline-delimited `data: <json>`
//! records terminated by a `data: [DONE]` sentinel. Raw bytes arrive in
//! arbitrary chunks, so a [`LineBuffer`] accumulates them and splits off
//! complete lines; the trailing partial line waits for the next arrival.
//! Decoding happens only on complete lines (and the final flush), so
//! multi-byte UTF-8 sequences split across chunk boundaries are never torn.
//!
//! Two byte sources feed the same buffer: the pull-style reader loop on a
//! live [`reqwest::Response`], and any push-style `Stream` of byte chunks a
//! host already holds.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::{
    ChatCompletionChunk, ChatMessage, GenerationParams, PorterClient, new_completion_id,
    unix_timestamp,
};

/// A lazy, finite sequence of completion chunks.
///
/// Chunks are emitted strictly in the order their lines arrived. Dropping
/// the stream stops all further transport reads.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, String>> + Send>>;

// ── Line framing ───────────────────────────────────────────────────

/// Reassembles newline-delimited records from raw byte chunks.
///
/// Bytes stay buffered until a full line is available, so a record (or a
/// single character) split across chunk boundaries is never decoded in
/// halves.
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a raw byte chunk.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Split off the next complete line, trimmed, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    /// Flush the trailing unterminated line at end-of-transport.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// What one complete line amounts to.
enum LineEvent {
    /// A parsed backend chunk, rewritten into the caller-facing shape.
    Chunk(ChatCompletionChunk),
    /// The `[DONE]` sentinel: nothing to emit, stop drawing from the
    /// transport once buffered lines have drained.
    Done,
    /// Keep-alive, comment, or unparseable payload.
    Skip,
}

fn frame_line(line: &str, model: &str) -> LineEvent {
    let Some(payload) = line.strip_prefix("data: ") else {
        // Keep-alives and SSE comments carry no data.
        return LineEvent::Skip;
    };
    if payload == "[DONE]" {
        return LineEvent::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => LineEvent::Chunk(chunk_from_value(value, model)),
        Err(e) => {
            // A single garbled line doesn't fail the stream.
            debug!("Dropping unparseable stream line: {e}");
            LineEvent::Skip
        }
    }
}

/// Rewrite a backend-native chunk into the caller-facing shape.
///
/// `id` and `created` come from the backend chunk when present and are
/// synthesized otherwise; `choices` and `usage` pass through verbatim. The
/// `model` field is always the caller's original id.
fn chunk_from_value(value: Value, model: &str) -> ChatCompletionChunk {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_completion_id);
    let created = value
        .get("created")
        .and_then(Value::as_u64)
        .unwrap_or_else(unix_timestamp);
    let choices = value
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let usage = value.get("usage").filter(|u| !u.is_null()).cloned();

    ChatCompletionChunk {
        id,
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices,
        usage,
    }
}

// ── Byte sources ───────────────────────────────────────────────────

/// Where stream bytes come from.
///
/// `reqwest` naturally exposes a pull-style reader on the live response;
/// hosts that already hold a byte stream hand it over as the push form.
/// Both drain into the same [`LineBuffer`], so the framing logic exists
/// once.
enum ByteSource {
    Reader(reqwest::Response),
    Stream(BoxStream<'static, Result<Vec<u8>, String>>),
}

impl ByteSource {
    /// Draw the next raw chunk; `None` at end-of-transport.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, String> {
        match self {
            ByteSource::Reader(response) => response
                .chunk()
                .await
                .map(|bytes| bytes.map(|b| b.to_vec()))
                .map_err(|e| format!("failed to read streaming chunk: {e}")),
            ByteSource::Stream(stream) => stream.next().await.transpose(),
        }
    }
}

/// Stream chunks off a live streamed driver-call response.
pub fn chunks_from_response(response: reqwest::Response, model: &str) -> ChunkStream {
    chunk_stream(ByteSource::Reader(response), model)
}

/// Stream chunks from any push-style byte stream.
pub fn chunks_from_bytes<S>(bytes: S, model: &str) -> ChunkStream
where
    S: Stream<Item = Result<Vec<u8>, String>> + Send + 'static,
{
    chunk_stream(ByteSource::Stream(bytes.boxed()), model)
}

// ── Stream assembly ────────────────────────────────────────────────

struct StreamState {
    source: ByteSource,
    lines: LineBuffer,
    ready: VecDeque<ChatCompletionChunk>,
    model: String,
    /// `[DONE]` seen: no further transport reads once `ready` drains.
    done: bool,
    /// Transport exhausted or failed: nothing further will be emitted.
    finished: bool,
}

fn chunk_stream(source: ByteSource, model: &str) -> ChunkStream {
    let state = StreamState {
        source,
        lines: LineBuffer::new(),
        ready: VecDeque::new(),
        model: model.to_string(),
        done: false,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.finished || state.done {
                return None;
            }
            match state.source.next_chunk().await {
                Ok(Some(bytes)) => {
                    state.lines.push(&bytes);
                    while let Some(line) = state.lines.next_line() {
                        apply_line(&mut state, &line);
                    }
                }
                Ok(None) => {
                    // End of transport: the trailing partial line counts as
                    // a last complete line.
                    state.finished = true;
                    if let Some(line) = state.lines.finish() {
                        apply_line(&mut state, &line);
                    }
                }
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}

fn apply_line(state: &mut StreamState, line: &str) {
    match frame_line(line, &state.model) {
        LineEvent::Chunk(chunk) => state.ready.push_back(chunk),
        LineEvent::Done => state.done = true,
        LineEvent::Skip => {}
    }
}

// ── Client entry point ─────────────────────────────────────────────

impl PorterClient {
    /// Open a streamed chat completion.
    ///
    /// The exchange is opened directly, without the retry orchestrator — a
    /// stream that already delivered chunks cannot be transparently
    /// replayed. A non-2xx response fails immediately, and a token source
    /// with nothing to give fails before any network I/O.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream, String> {
        let token = self.bearer_token()?;
        let call = self.build_call(model, messages, params, true);
        debug!(
            "Opening streamed driver call: model={model}, messages={}",
            messages.len()
        );

        let response = self
            .client
            .post(self.call_url())
            .header("Authorization", format!("Bearer {token}"))
            .json(&call)
            .send()
            .await
            .map_err(|e| format!("streaming request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("driver call HTTP {status}: {text}"));
        }

        Ok(chunks_from_response(response, model))
    }
}
