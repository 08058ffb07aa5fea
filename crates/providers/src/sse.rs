//! Incremental decoder for OpenAI-style chat completion SSE streams.
//!
//! Bytes are buffered until a full line is available, so multi-byte UTF-8
//! sequences split across network chunks decode correctly. Operation call
//! deltas are accumulated by their stream index and released, in index
//! order, on the final chunk.

use std::collections::BTreeMap;

use parley_core::error::ModelError;
use parley_core::message::MessageOperationCall;
use parley_core::model::{ModelChunk, Usage};
use serde::Deserialize;
use tracing::trace;

#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    calls: BTreeMap<u32, CallAccumulator>,
    usage: Option<Usage>,
    finished: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns every chunk completed by them.
    ///
    /// After a chunk with `done = true` (or an error) the decoder is
    /// finished and ignores further input.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ModelChunk, ModelError>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(item) = self.decode_line(line) {
                let terminal = match &item {
                    Ok(chunk) => chunk.done,
                    Err(_) => true,
                };
                out.push(item);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        out
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// The closing chunk for a stream that ended without `[DONE]`.
    pub(crate) fn finish(&mut self) -> ModelChunk {
        self.finished = true;
        self.final_chunk()
    }

    fn decode_line(&mut self, line: &str) -> Option<Result<ModelChunk, ModelError>> {
        // Blank lines separate events; ':' starts a comment
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let data = line.strip_prefix("data:")?.trim();

        if data == "[DONE]" {
            return Some(Ok(self.final_chunk()));
        }

        let response = match serde_json::from_str::<StreamResponse>(data) {
            Ok(r) => r,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return None;
            }
        };

        if let Some(error) = response.error {
            return Some(Err(ModelError::ApiError {
                status_code: 200,
                message: error.message,
            }));
        }

        // Usage may ride on any chunk; it is reported once, on the final one
        if let Some(usage) = response.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let choice = response.choices.into_iter().next()?;
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                acc.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    acc.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    acc.arguments.push_str(&arguments);
                }
            }
        }

        let text = choice.delta.content.filter(|c| !c.is_empty())?;
        Some(Ok(ModelChunk::text(text)))
    }

    fn final_chunk(&mut self) -> ModelChunk {
        let operation_calls = std::mem::take(&mut self.calls)
            .into_values()
            .map(CallAccumulator::into_call)
            .collect();
        ModelChunk {
            text_delta: None,
            operation_calls,
            usage: self.usage.take(),
            done: true,
        }
    }
}

#[derive(Default)]
struct CallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl CallAccumulator {
    fn into_call(self) -> MessageOperationCall {
        MessageOperationCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
            priority: 0,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut SseDecoder, text: &str) -> Vec<ModelChunk> {
        decoder
            .feed(text.as_bytes())
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn content_deltas_become_text_chunks() {
        let mut d = SseDecoder::default();
        let chunks = feed_all(
            &mut d,
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        );
        let text: String = chunks.iter().filter_map(|c| c.text_delta.clone()).collect();
        assert_eq!(text, "Hello");
        assert!(!d.is_finished());
    }

    #[test]
    fn lines_split_across_feeds() {
        let mut d = SseDecoder::default();
        assert!(d.feed(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());
        let chunks = feed_all(&mut d, "tent\":\"Hi\"}}]}\n");
        assert_eq!(chunks[0].text_delta.as_deref(), Some("Hi"));
    }

    #[test]
    fn multibyte_char_split_across_feeds() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;
        let mut d = SseDecoder::default();
        assert!(d.feed(&bytes[..split]).is_empty());
        let chunks: Vec<_> = d.feed(&bytes[split..]).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks[0].text_delta.as_deref(), Some("é"));
    }

    #[test]
    fn call_deltas_accumulate_by_index() {
        let mut d = SseDecoder::default();
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_b\",\"function\":{\"name\":\"end_turn\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"send_email\",\"arguments\":\"{\\\"to\\\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\":\\\"a@b.c\\\"}\"}}]}}]}\n",
            "data: [DONE]\n",
        );
        let chunks = feed_all(&mut d, stream);
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert_eq!(last.operation_calls.len(), 2);
        assert_eq!(last.operation_calls[0].id, "call_a");
        assert_eq!(last.operation_calls[0].arguments, r#"{"to":"a@b.c"}"#);
        assert_eq!(last.operation_calls[1].name, "end_turn");
        assert!(d.is_finished());
    }

    #[test]
    fn usage_is_reported_on_the_final_chunk() {
        let mut d = SseDecoder::default();
        let chunks = feed_all(
            &mut d,
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n\
             data: [DONE]\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 15);
        assert!(chunks[0].done);
    }

    #[test]
    fn usage_on_a_content_chunk_keeps_the_text() {
        let mut d = SseDecoder::default();
        let chunks = feed_all(
            &mut d,
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text_delta.as_deref(), Some("Hi"));
        assert!(!chunks[0].done);
        assert!(!d.is_finished());

        let chunks = feed_all(&mut d, "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\ndata: [DONE]\n");
        assert_eq!(chunks[0].text_delta.as_deref(), Some(" there"));
        assert!(chunks[1].done);
        assert_eq!(chunks[1].usage.unwrap().total_tokens, 4);
    }

    #[test]
    fn comments_and_garbage_are_ignored() {
        let mut d = SseDecoder::default();
        let chunks = feed_all(&mut d, ": keep-alive\nevent: ping\ndata: not json\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn error_payload_is_a_model_error() {
        let mut d = SseDecoder::default();
        let items = d.feed(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        assert!(matches!(&items[0], Err(ModelError::ApiError { message, .. }) if message == "overloaded"));
        assert!(d.is_finished());
    }

    #[test]
    fn finish_flushes_pending_calls() {
        let mut d = SseDecoder::default();
        d.feed(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"end_turn\"}}]}}]}\n");
        let last = d.finish();
        assert!(last.done);
        assert_eq!(last.operation_calls[0].name, "end_turn");
    }
}
