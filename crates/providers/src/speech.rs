//! OpenAI-compatible text-to-speech (`POST /audio/speech`).

use std::time::Duration;

use async_trait::async_trait;
use parley_core::error::OperationError;
use parley_core::speech::{SpeechSynthesizer, SynthesizedSpeech};
use tracing::debug;

use crate::openai::http_client;

const KIND: &str = "speech";

pub struct OpenAiSpeechSynthesizer {
    model: String,
    voice: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiSpeechSynthesizer {
    pub fn new(
        model: impl Into<String>,
        voice: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            voice: voice.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client(Duration::from_secs(30)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

fn failed(reason: impl Into<String>) -> OperationError {
    OperationError::ExecutionFailed {
        kind: KIND.into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech, OperationError> {
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "mp3",
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OperationError::Timeout {
                        kind: KIND.into(),
                        timeout_ms: 0,
                    }
                } else {
                    failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {}: {text}", status.as_u16())));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let audio = response.bytes().await.map_err(|e| failed(e.to_string()))?;

        debug!(bytes = audio.len(), chars = text.len(), "Synthesized sentence");
        Ok(SynthesizedSpeech {
            audio: audio.to_vec(),
            mime_type,
        })
    }
}
