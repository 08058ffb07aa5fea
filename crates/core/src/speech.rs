//! Speech synthesis trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// Audio produced for one sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedSpeech {
    pub audio: Vec<u8>,
    /// e.g. "audio/mpeg"
    pub mime_type: String,
}

/// A text-to-speech backend. Synthesis has no side effects, so callers may
/// drop an in-flight call.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech, OperationError>;
}
