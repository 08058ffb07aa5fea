//! The hybrid retrieval pipeline.
//!
//! For one query and identity:
//! 1. Semantic pass: embed, fetch `top_k × 2` nearest chunks, apply the
//!    similarity floor.
//! 2. Optional lexical pass (BM25 inside the index) fused with the semantic
//!    ranking by Reciprocal Rank Fusion.
//! 3. Optional diversity rerank that drops near-duplicates.
//! 4. Greedy packing into the token budget.
//!
//! Retrieval never fails the caller: every failure degrades to a weaker
//! strategy, down to an empty bundle.

use std::sync::Arc;

use parley_core::retrieval::{
    ChunkIndex, EmbeddingService, RetrievalBundle, RetrievalCandidate, RetrievalMethod,
    ScoredChunk,
};
use parley_core::IdentityPartition;
use tracing::{debug, error, warn};

use crate::diversity::diversify;
use crate::text::query_terms;
use crate::tokens::{HeuristicCounter, TokenCounter};
use crate::vector::{reciprocal_rank_fusion, sort_by_score};

/// Per-call retrieval parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub use_hybrid: bool,
    pub use_rerank: bool,
    pub max_tokens: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 8,
            use_hybrid: true,
            use_rerank: true,
            max_tokens: 2000,
        }
    }
}

/// Pipeline-wide tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub similarity_floor: f32,
    pub diversity_threshold: f32,
    pub rrf_k: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            similarity_floor: 0.25,
            diversity_threshold: 0.7,
            rrf_k: 60.0,
        }
    }
}

pub struct RetrievalPipeline {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn ChunkIndex>,
    counter: Arc<dyn TokenCounter>,
    settings: PipelineSettings,
}

impl RetrievalPipeline {
    pub fn new(embedder: Arc<dyn EmbeddingService>, index: Arc<dyn ChunkIndex>) -> Self {
        Self {
            embedder,
            index,
            counter: Arc::new(HeuristicCounter),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Retrieve a token-budgeted bundle of context for `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        identity: &IdentityPartition,
        options: &RetrievalOptions,
    ) -> RetrievalBundle {
        if options.top_k == 0 || options.max_tokens == 0 {
            return RetrievalBundle::empty(query, RetrievalMethod::SemanticOnly);
        }
        let fetch = options.top_k.saturating_mul(2);

        let semantic = self.semantic_pass(query, identity, fetch).await;

        let (ranked, method) = match (semantic, options.use_hybrid) {
            (Ok(semantic), false) => (
                from_single(semantic, Lane::Semantic),
                RetrievalMethod::SemanticOnly,
            ),
            (Ok(semantic), true) => match self.lexical_pass(query, identity, fetch).await {
                Ok(lexical) => {
                    let fused = reciprocal_rank_fusion(&semantic, &lexical, self.settings.rrf_k)
                        .into_iter()
                        .map(|hit| Ranked {
                            chunk: hit.chunk,
                            embedding_score: hit.semantic_score,
                            lexical_score: hit.lexical_score,
                            fused_score: hit.fused_score,
                        })
                        .collect();
                    (fused, RetrievalMethod::HybridReranked)
                }
                Err(e) => {
                    warn!(identity = %identity, "Hybrid fusion failed, using semantic ranking: {e}");
                    (
                        from_single(semantic, Lane::Semantic),
                        RetrievalMethod::SemanticOnlyDegraded,
                    )
                }
            },
            (Err(e), true) => {
                warn!(identity = %identity, "Semantic retrieval failed, trying lexical only: {e}");
                match self.lexical_pass(query, identity, fetch).await {
                    Ok(lexical) => (
                        from_single(lexical, Lane::Lexical),
                        RetrievalMethod::LexicalOnlyDegraded,
                    ),
                    Err(e) => {
                        warn!(identity = %identity, "Lexical retrieval failed too: {e}");
                        return RetrievalBundle::empty(query, RetrievalMethod::Unavailable);
                    }
                }
            }
            (Err(e), false) => {
                warn!(identity = %identity, "Semantic retrieval failed: {e}");
                return RetrievalBundle::empty(query, RetrievalMethod::Unavailable);
            }
        };

        let candidates: Vec<RetrievalCandidate> = ranked
            .into_iter()
            .filter(|r| {
                if &r.chunk.identity == identity {
                    true
                } else {
                    error!(
                        requested = %identity,
                        returned = %r.chunk.identity,
                        chunk_id = %r.chunk.chunk_id,
                        "Index returned a chunk from another identity; dropping it"
                    );
                    false
                }
            })
            .map(|r| RetrievalCandidate {
                token_estimate: self.counter.count(&r.chunk.text),
                chunk_id: r.chunk.chunk_id,
                document_id: r.chunk.document_id,
                text: r.chunk.text,
                embedding_score: r.embedding_score,
                lexical_score: r.lexical_score,
                fused_score: r.fused_score,
                identity: r.chunk.identity,
            })
            .collect();

        let candidates = if options.use_rerank {
            diversify(candidates, self.settings.diversity_threshold)
        } else {
            candidates
        };

        let (selected_chunks, tokens_used) =
            pack_budget(candidates, options.top_k, options.max_tokens);

        debug!(
            identity = %identity,
            method = ?method,
            chunks = selected_chunks.len(),
            tokens = tokens_used,
            "Retrieved context"
        );

        RetrievalBundle {
            query: query.to_string(),
            selected_chunks,
            tokens_used,
            method_used: method,
        }
    }

    async fn semantic_pass(
        &self,
        query: &str,
        identity: &IdentityPartition,
        fetch: usize,
    ) -> Result<Vec<ScoredChunk>, parley_core::RetrievalError> {
        let vector = self.embedder.embed(query).await?;
        let mut hits = self.index.vector_search(&vector, identity, fetch).await?;
        hits.retain(|h| h.score >= self.settings.similarity_floor);
        sort_by_score(&mut hits);
        Ok(hits)
    }

    async fn lexical_pass(
        &self,
        query: &str,
        identity: &IdentityPartition,
        fetch: usize,
    ) -> Result<Vec<ScoredChunk>, parley_core::RetrievalError> {
        let terms = query_terms(query);
        let mut hits = self.index.lexical_search(&terms, identity, fetch).await?;
        sort_by_score(&mut hits);
        Ok(hits)
    }
}

struct Ranked {
    chunk: ScoredChunk,
    embedding_score: f32,
    lexical_score: f32,
    fused_score: f32,
}

enum Lane {
    Semantic,
    Lexical,
}

/// A single ranking, with its own score standing in for the fused score.
fn from_single(hits: Vec<ScoredChunk>, lane: Lane) -> Vec<Ranked> {
    hits.into_iter()
        .map(|chunk| {
            let score = chunk.score;
            let (embedding_score, lexical_score) = match lane {
                Lane::Semantic => (score, 0.0),
                Lane::Lexical => (0.0, score),
            };
            Ranked {
                chunk,
                embedding_score,
                lexical_score,
                fused_score: score,
            }
        })
        .collect()
}

/// Take candidates in order until the next would exceed `max_tokens`, or
/// `top_k` are selected.
fn pack_budget(
    candidates: Vec<RetrievalCandidate>,
    top_k: usize,
    max_tokens: usize,
) -> (Vec<RetrievalCandidate>, usize) {
    let mut selected = Vec::new();
    let mut used = 0usize;
    for candidate in candidates {
        if selected.len() >= top_k || used + candidate.token_estimate > max_tokens {
            break;
        }
        used += candidate.token_estimate;
        selected.push(candidate);
    }
    (selected, used)
}
