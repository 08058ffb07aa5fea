//! OpenAI-compatible model service.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI and any other
//! endpoint exposing `/chat/completions` with SSE streaming and function
//! calling. Operation kinds are advertised as functions; function calls in
//! the response become operation calls.

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::error::ModelError;
use parley_core::message::{Message, Role};
use parley_core::model::{ModelRequest, ModelService, ModelStream, OperationSpec};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::sse::SseDecoder;

/// Chunks buffered between the HTTP reader and the orchestrator.
const STREAM_BUFFER: usize = 64;

pub struct OpenAiCompatModelService {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatModelService {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client(Duration::from_secs(120)),
        }
    }

    /// Create an OpenAI service (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama service (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Bound each round-trip, including the streamed body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(request: &ModelRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(ApiMessage {
                role: "system",
                content: Some(request.system_prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        messages.extend(request.history.iter().map(to_api_message));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.operations.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.operations));
        }

        body
    }
}

#[async_trait]
impl ModelService for OpenAiCompatModelService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);

        debug!(
            service = %self.name,
            model = %request.model,
            history = request.history.len(),
            operations = request.operations.len(),
            "Submitting model round"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        check_status(response).await.map(|response| {
            let (tx, rx) = tokio::sync::mpsc::channel(STREAM_BUFFER);

            // Read the SSE byte stream on its own task
            tokio::spawn(async move {
                let mut decoder = SseDecoder::default();
                let mut bytes = response.bytes_stream();

                while let Some(next) = bytes.next().await {
                    let bytes = match next {
                        Ok(b) => b,
                        Err(e) => {
                            let _ = tx.send(Err(ModelError::StreamInterrupted(e.to_string()))).await;
                            return;
                        }
                    };

                    for item in decoder.feed(&bytes) {
                        if tx.send(item).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                    if decoder.is_finished() {
                        return;
                    }
                }

                // Stream ended without [DONE]
                let _ = tx.send(Ok(decoder.finish())).await;
            });

            rx
        })
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

pub(crate) fn map_transport_error(e: reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout(e.to_string())
    } else {
        ModelError::Network(e.to_string())
    }
}

/// Map a non-success status to a [`ModelError`].
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status().as_u16();
    if status == 200 {
        return Ok(response);
    }

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(5);
        return Err(ModelError::RateLimited { retry_after_secs });
    }

    if status == 401 || status == 403 {
        return Err(ModelError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    let error_body = response.text().await.unwrap_or_default();
    warn!(status, body = %error_body, "Model service returned error");
    Err(ModelError::ApiError {
        status_code: status,
        message: error_body,
    })
}

fn to_api_message(m: &Message) -> ApiMessage {
    ApiMessage {
        role: match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        },
        content: Some(m.content.clone()),
        tool_calls: if m.operation_calls.is_empty() {
            None
        } else {
            Some(
                m.operation_calls
                    .iter()
                    .map(|call| ApiToolCall {
                        id: call.id.clone(),
                        r#type: "function",
                        function: ApiFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        },
        tool_call_id: m.operation_call_id.clone(),
    }
}

fn to_api_tools(operations: &[OperationSpec]) -> Vec<ApiToolDefinition> {
    operations
        .iter()
        .map(|op| ApiToolDefinition {
            r#type: "function",
            function: ApiToolFunction {
                name: op.name.clone(),
                description: op.description.clone(),
                parameters: op.parameters.clone(),
            },
        })
        .collect()
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: &'static str,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: &'static str,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}
