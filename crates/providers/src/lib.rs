//! HTTP service implementations for Parley.
//!
//! Everything here speaks the OpenAI-compatible API: streamed chat
//! completions with function calling, embeddings and speech. Each type
//! implements one of the `parley_core` service traits.

pub mod embeddings;
pub mod openai;
pub mod speech;
mod sse;

use std::sync::Arc;
use std::time::Duration;

use parley_config::{ModelConfig, SpeechConfig};
use parley_core::model::ModelService;
use parley_core::speech::SpeechSynthesizer;

pub use embeddings::OpenAiEmbeddingService;
pub use openai::OpenAiCompatModelService;
pub use speech::OpenAiSpeechSynthesizer;

/// Build the model service described by `[model]`.
pub fn model_service(config: &ModelConfig) -> Arc<dyn ModelService> {
    let api_key = config.api_key.clone().unwrap_or_default();
    Arc::new(
        OpenAiCompatModelService::new("openai-compatible", &config.base_url, api_key)
            .with_timeout(Duration::from_secs(config.request_timeout_secs)),
    )
}

/// Build the embedding service for a remote embedding model.
pub fn embedding_service(config: &ModelConfig, embedding_model: &str) -> OpenAiEmbeddingService {
    OpenAiEmbeddingService::new(
        embedding_model,
        &config.base_url,
        config.api_key.clone().unwrap_or_default(),
    )
}

/// Build the speech synthesizer, or `None` when speech is disabled.
pub fn speech_synthesizer(
    model: &ModelConfig,
    speech: &SpeechConfig,
) -> Option<Arc<dyn SpeechSynthesizer>> {
    if !speech.enabled {
        return None;
    }
    Some(Arc::new(OpenAiSpeechSynthesizer::new(
        &speech.model,
        &speech.voice,
        &model.base_url,
        model.api_key.clone().unwrap_or_default(),
    )))
}
