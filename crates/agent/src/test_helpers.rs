//! Shared test doubles: a scripted model service, mock operation handlers
//! and mock speech synthesizers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use parley_core::error::{ModelError, OperationError};
use parley_core::message::MessageOperationCall;
use parley_core::model::{ModelChunk, ModelRequest, ModelService, ModelStream, Usage};
use parley_core::operation::{
    OperationContext, OperationHandler, OperationKind, OperationOutput, OperationRequest,
};
use parley_core::speech::{SpeechSynthesizer, SynthesizedSpeech};
use parley_core::stream::StreamEvent;
use parley_retrieval::{HashingEmbedder, InMemoryIndex, RetrievalPipeline};
use tokio::sync::mpsc;

/// One scripted model round-trip.
#[derive(Debug, Clone)]
pub enum ScriptedRound {
    /// Stream these chunks; the last one should be `done`.
    Reply(Vec<ModelChunk>),
    /// Fail at submit time.
    SubmitError(ModelError),
    /// Stream these chunks, then fail mid-stream.
    FailMidStream(Vec<ModelChunk>, ModelError),
}

/// Usage reported by every scripted reply.
pub const ROUND_USAGE: Usage = Usage {
    prompt_tokens: 10,
    completion_tokens: 5,
    total_tokens: 15,
};

/// A model service that plays back scripted rounds in order.
///
/// Once the script runs out it repeats the `repeat` round if one was set,
/// and otherwise fails the round.
pub struct ScriptedModelService {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    repeat: Option<ScriptedRound>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelService {
    pub fn new(rounds: Vec<ScriptedRound>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every round with the same script.
    pub fn repeating(round: ScriptedRound) -> Self {
        Self {
            rounds: Mutex::new(VecDeque::new()),
            repeat: Some(round),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A single text answer with no operation calls.
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![text_round(text)])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelService for ScriptedModelService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        self.requests.lock().unwrap().push(request);
        let next = self.rounds.lock().unwrap().pop_front();
        let round = next.or_else(|| self.repeat.clone()).ok_or_else(|| ModelError::ApiError {
            status_code: 500,
            message: "script exhausted".into(),
        })?;

        let (chunks, trailing_error) = match round {
            ScriptedRound::SubmitError(e) => return Err(e),
            ScriptedRound::Reply(chunks) => (chunks, None),
            ScriptedRound::FailMidStream(chunks, e) => (chunks, Some(e)),
        };

        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        if let Some(e) = trailing_error {
            let _ = tx.send(Err(e)).await;
        }
        Ok(rx)
    }
}

/// Split text into word-sized deltas.
pub fn text_chunks(text: &str) -> Vec<ModelChunk> {
    text.split_inclusive(' ').map(ModelChunk::text).collect()
}

fn done_chunk(operation_calls: Vec<MessageOperationCall>) -> ModelChunk {
    ModelChunk {
        text_delta: None,
        operation_calls,
        usage: Some(ROUND_USAGE),
        done: true,
    }
}

/// A round that answers with text only.
pub fn text_round(text: &str) -> ScriptedRound {
    let mut chunks = text_chunks(text);
    chunks.push(done_chunk(vec![]));
    ScriptedRound::Reply(chunks)
}

/// A round that says `text` and then requests `calls`.
pub fn operation_round(text: &str, calls: Vec<MessageOperationCall>) -> ScriptedRound {
    let mut chunks = text_chunks(text);
    chunks.push(done_chunk(calls));
    ScriptedRound::Reply(chunks)
}

/// An operation call as the model would issue it.
pub fn call(id: &str, name: &str, args: serde_json::Value) -> MessageOperationCall {
    MessageOperationCall {
        id: id.into(),
        name: name.into(),
        arguments: args.to_string(),
        priority: 0,
    }
}

/// Handler that records requests and answers with a fixed payload.
pub struct RecordingHandler {
    kind: OperationKind,
    payload: serde_json::Value,
    seen: Mutex<Vec<OperationRequest>>,
}

impl RecordingHandler {
    pub fn new(kind: OperationKind) -> Self {
        Self::with_payload(kind, serde_json::json!({"ok": true}))
    }

    pub fn with_payload(kind: OperationKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<OperationRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OperationHandler for RecordingHandler {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    async fn handle(
        &self,
        _context: &OperationContext,
        request: &OperationRequest,
    ) -> Result<OperationOutput, OperationError> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(OperationOutput::json(self.payload.clone()))
    }
}

/// Handler that always fails.
pub struct FailingHandler(pub OperationKind);

#[async_trait::async_trait]
impl OperationHandler for FailingHandler {
    fn kind(&self) -> OperationKind {
        self.0
    }

    async fn handle(
        &self,
        _context: &OperationContext,
        _request: &OperationRequest,
    ) -> Result<OperationOutput, OperationError> {
        Err(OperationError::ExecutionFailed {
            kind: self.0.to_string(),
            reason: "upstream unavailable".into(),
        })
    }
}

/// Synthesizer whose audio is the sentence's own bytes.
pub struct TestSynthesizer;

#[async_trait::async_trait]
impl SpeechSynthesizer for TestSynthesizer {
    fn name(&self) -> &str {
        "test"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech, OperationError> {
        Ok(SynthesizedSpeech {
            audio: text.as_bytes().to_vec(),
            mime_type: "audio/test".into(),
        })
    }
}

pub struct FailingSynthesizer;

#[async_trait::async_trait]
impl SpeechSynthesizer for FailingSynthesizer {
    fn name(&self) -> &str {
        "failing"
    }

    async fn synthesize(&self, _text: &str) -> Result<SynthesizedSpeech, OperationError> {
        Err(OperationError::ExecutionFailed {
            kind: "speech".into(),
            reason: "voice unavailable".into(),
        })
    }
}

/// Synthesizer that never answers.
pub struct StallingSynthesizer;

#[async_trait::async_trait]
impl SpeechSynthesizer for StallingSynthesizer {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn synthesize(&self, _text: &str) -> Result<SynthesizedSpeech, OperationError> {
        std::future::pending().await
    }
}

/// A pipeline over an empty in-memory index.
pub fn empty_pipeline() -> (Arc<RetrievalPipeline>, Arc<InMemoryIndex>, Arc<HashingEmbedder>) {
    let embedder = Arc::new(HashingEmbedder::default());
    let index = Arc::new(InMemoryIndex::new());
    let pipeline = Arc::new(RetrievalPipeline::new(embedder.clone(), index.clone()));
    (pipeline, index, embedder)
}

/// Read events until the sender side is dropped.
pub async fn collect_events(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
