//! OpenAI-compatible embedding service (`POST /embeddings`).

use std::time::Duration;

use async_trait::async_trait;
use parley_core::error::RetrievalError;
use parley_core::retrieval::EmbeddingService;
use serde::Deserialize;
use tracing::debug;

use crate::openai::http_client;

pub struct OpenAiEmbeddingService {
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbeddingService {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
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

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::EmbeddingFailed(format!(
                "HTTP {}: {text}",
                status.as_u16()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed(format!("bad response: {e}")))?;

        let vector = first_embedding(parsed)?;
        debug!(model = %self.model, dims = vector.len(), "Embedded text");
        Ok(vector)
    }
}

fn first_embedding(response: EmbeddingResponse) -> Result<Vec<f32>, RetrievalError> {
    response
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RetrievalError::EmbeddingFailed("response contained no embedding".into()))
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_embedding() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.1,-0.2,0.3]}],"model":"m"}"#,
        )
        .unwrap();
        assert_eq!(first_embedding(response).unwrap(), vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn empty_data_is_an_error() {
        let response: EmbeddingResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(
            first_embedding(response),
            Err(RetrievalError::EmbeddingFailed(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_softly() {
        let service = OpenAiEmbeddingService::new("text-embedding-3-small", "http://127.0.0.1:9", "k")
            .with_timeout(Duration::from_secs(2));
        let err = service.embed("hello").await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingFailed(_)));
    }
}
