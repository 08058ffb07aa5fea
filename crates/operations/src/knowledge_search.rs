//! `knowledge_search`: explicit retrieval over the caller's own documents.
//!
//! Runs the retrieval pipeline for the identity the turn belongs to; the
//! model cannot name another partition.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::error::OperationError;
use parley_core::operation::{
    OperationContext, OperationHandler, OperationKind, OperationOutput, OperationRequest,
};
use parley_retrieval::{RetrievalOptions, RetrievalPipeline};

/// Hard cap on `top_k` requested by the model.
const MAX_TOP_K: u64 = 20;

pub struct KnowledgeSearchHandler {
    pipeline: Arc<RetrievalPipeline>,
    options: RetrievalOptions,
}

impl KnowledgeSearchHandler {
    pub fn new(pipeline: Arc<RetrievalPipeline>, options: RetrievalOptions) -> Self {
        Self { pipeline, options }
    }
}

#[async_trait]
impl OperationHandler for KnowledgeSearchHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::KnowledgeSearch
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum number of passages to return",
                    "default": self.options.top_k
                }
            },
            "required": ["query"]
        })
    }

    async fn handle(
        &self,
        context: &OperationContext,
        request: &OperationRequest,
    ) -> Result<OperationOutput, OperationError> {
        let query = request.required_str("query")?;
        if query.trim().is_empty() {
            return Err(OperationError::InvalidParameters {
                kind: self.kind().to_string(),
                reason: "'query' must not be empty".into(),
            });
        }

        let mut options = self.options;
        if let Some(top_k) = request.parameters.get("top_k").and_then(|v| v.as_u64()) {
            options.top_k = top_k.clamp(1, MAX_TOP_K) as usize;
        }

        let bundle = self
            .pipeline
            .retrieve(query, &context.identity, &options)
            .await;

        let passages: Vec<serde_json::Value> = bundle
            .selected_chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "chunk_id": c.chunk_id,
                    "document_id": c.document_id,
                    "text": c.text,
                    "score": c.fused_score,
                })
            })
            .collect();

        Ok(OperationOutput::json(serde_json::json!({
            "query": bundle.query,
            "method": bundle.method_used,
            "tokens_used": bundle.tokens_used,
            "passages": passages,
        })))
    }
}
