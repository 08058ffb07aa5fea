//! Model service trait: the abstraction over the hosted generative model.
//!
//! A model service receives the system prompt, the compacted history and the
//! operation kinds the model may request, and answers with a stream of
//! chunks: text deltas, operation calls, and usage statistics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ModelError;
use crate::message::{Message, MessageOperationCall};

/// One round-trip request to the model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// Instructions plus retrieved context
    pub system_prompt: String,

    /// Compacted recent history, oldest first
    pub history: Vec<Message>,

    /// Operation kinds the model may request this round
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationSpec>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// An operation kind advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Wire name of the kind
    pub name: String,

    /// What the operation does
    pub description: String,

    /// JSON Schema describing the parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Add another usage report to this running total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A single chunk of a model response stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelChunk {
    /// Partial text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,

    /// Operation calls or call deltas (merged by id)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operation_calls: Vec<MessageOperationCall>,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,
}

impl ModelChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: Some(delta.into()),
            ..Self::default()
        }
    }
}

/// Receiver half of a model response stream.
pub type ModelStream = mpsc::Receiver<std::result::Result<ModelChunk, ModelError>>;

/// The core model service trait.
///
/// The orchestrator calls `submit()` once per round without knowing which
/// backend is in use.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// A human-readable name (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Submit one round and receive the response as a stream of chunks.
    ///
    /// An `Err` here, or an `Err` item inside the stream, is a failed
    /// round-trip.
    async fn submit(&self, request: ModelRequest) -> std::result::Result<ModelStream, ModelError>;
}
