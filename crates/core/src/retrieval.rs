//! Retrieval traits and value types.
//!
//! The retrieval pipeline consumes two external services:
//! - an [`EmbeddingService`] turning text into vectors
//! - a [`ChunkIndex`] answering vector and lexical searches, always
//!   filtered to one identity partition
//!
//! and produces a [`RetrievalBundle`] for the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::identity::IdentityPartition;

/// A chunk as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique chunk ID
    pub id: String,

    /// Document the chunk was cut from
    pub document_id: String,

    /// Owning partition
    pub identity: IdentityPartition,

    /// Chunk text
    pub text: String,

    /// Embedding vector
    #[serde(skip)]
    pub embedding: Vec<f32>,

    /// When the chunk was ingested
    pub ingested_at: DateTime<Utc>,
}

/// A single hit from a vector or lexical search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
    pub identity: IdentityPartition,
}

/// A candidate chunk moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Cosine similarity from the semantic pass (0 if only lexically matched)
    pub embedding_score: f32,
    /// BM25 score from the lexical pass (0 if only semantically matched)
    pub lexical_score: f32,
    /// RRF score, or the embedding score when fusion did not run
    pub fused_score: f32,
    pub token_estimate: usize,
    pub identity: IdentityPartition,
}

/// Which strategy produced a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    /// Semantic and lexical rankings fused with RRF
    HybridReranked,
    /// Hybrid fusion was not requested
    SemanticOnly,
    /// Hybrid fusion was requested but failed
    SemanticOnlyDegraded,
    /// The semantic pass failed; lexical ranking alone was used
    LexicalOnlyDegraded,
    /// Every strategy failed; the bundle is empty
    Unavailable,
}

impl RetrievalMethod {
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            Self::SemanticOnlyDegraded | Self::LexicalOnlyDegraded | Self::Unavailable
        )
    }
}

/// The token-budgeted result of one retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalBundle {
    pub query: String,
    pub selected_chunks: Vec<RetrievalCandidate>,
    pub tokens_used: usize,
    pub method_used: RetrievalMethod,
}

impl RetrievalBundle {
    pub fn empty(query: impl Into<String>, method: RetrievalMethod) -> Self {
        Self {
            query: query.into(),
            selected_chunks: Vec::new(),
            tokens_used: 0,
            method_used: method,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected_chunks.is_empty()
    }
}

/// Turns text into an embedding vector.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// An identity-partitioned chunk index.
///
/// Implementations must never return a chunk from a partition other than
/// the one requested, and must tolerate concurrent insertion and search.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Nearest chunks to `vector`, highest similarity first.
    async fn vector_search(
        &self,
        vector: &[f32],
        identity: &IdentityPartition,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError>;

    /// Best lexical matches for `terms`, highest score first.
    async fn lexical_search(
        &self,
        terms: &[String],
        identity: &IdentityPartition,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError>;

    /// Insert chunks into their own partitions. Returns the number inserted.
    async fn insert(&self, chunks: Vec<ChunkRecord>) -> Result<usize, RetrievalError>;

    /// Number of chunks in a partition.
    async fn count(&self, identity: &IdentityPartition) -> Result<usize, RetrievalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bundle_has_no_tokens() {
        let bundle = RetrievalBundle::empty("q", RetrievalMethod::Unavailable);
        assert!(bundle.is_empty());
        assert_eq!(bundle.tokens_used, 0);
        assert!(bundle.method_used.is_degraded());
    }

    #[test]
    fn method_serializes_snake_case() {
        let json = serde_json::to_string(&RetrievalMethod::SemanticOnlyDegraded).unwrap();
        assert_eq!(json, r#""semantic_only_degraded""#);
        assert!(!RetrievalMethod::HybridReranked.is_degraded());
    }
}
