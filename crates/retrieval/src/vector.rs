//! Vector similarity and rank fusion.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - Nearest-chunk ranking over a partition
//! - Reciprocal Rank Fusion (RRF) for merging the semantic and lexical rankings

use std::collections::HashMap;

use parley_core::{ChunkRecord, ScoredChunk};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Rank chunks by cosine similarity to `query`, highest first.
///
/// Chunks without an embedding are skipped.
pub fn rank_by_similarity(chunks: &[ChunkRecord], query: &[f32], limit: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .filter(|c| !c.embedding.is_empty())
        .map(|c| ScoredChunk {
            chunk_id: c.id.clone(),
            document_id: c.document_id.clone(),
            text: c.text.clone(),
            score: cosine_similarity(&c.embedding, query),
            identity: c.identity.clone(),
        })
        .collect();

    sort_by_score(&mut scored);
    scored.truncate(limit);
    scored
}

/// Sort hits by descending score; ties keep their relative order.
pub fn sort_by_score(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// One entry of a fused ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk: ScoredChunk,
    /// Score from the semantic list, 0 if absent there
    pub semantic_score: f32,
    /// Score from the lexical list, 0 if absent there
    pub lexical_score: f32,
    /// Σ 1/(k + rank) over the lists the chunk appears in
    pub fused_score: f32,
}

/// Reciprocal Rank Fusion: merge two ranked result lists.
///
/// Each chunk's fused score is the sum of `1/(k + rank)` across both lists,
/// with ranks starting at 1. Chunks are deduplicated by id and returned by
/// fused score descending; ties are broken by semantic score, then by the
/// order the chunk was first seen.
pub fn reciprocal_rank_fusion(
    semantic: &[ScoredChunk],
    lexical: &[ScoredChunk],
    k: f32,
) -> Vec<FusedHit> {
    let mut order: Vec<String> = Vec::new();
    let mut hits: HashMap<String, FusedHit> = HashMap::new();

    for (rank, chunk) in semantic.iter().enumerate() {
        let rrf = 1.0 / (k + rank as f32 + 1.0);
        let hit = hits.entry(chunk.chunk_id.clone()).or_insert_with(|| {
            order.push(chunk.chunk_id.clone());
            FusedHit {
                chunk: chunk.clone(),
                semantic_score: 0.0,
                lexical_score: 0.0,
                fused_score: 0.0,
            }
        });
        hit.semantic_score = chunk.score;
        hit.fused_score += rrf;
    }

    for (rank, chunk) in lexical.iter().enumerate() {
        let rrf = 1.0 / (k + rank as f32 + 1.0);
        let hit = hits.entry(chunk.chunk_id.clone()).or_insert_with(|| {
            order.push(chunk.chunk_id.clone());
            FusedHit {
                chunk: chunk.clone(),
                semantic_score: 0.0,
                lexical_score: 0.0,
                fused_score: 0.0,
            }
        });
        hit.lexical_score = chunk.score;
        hit.fused_score += rrf;
    }

    let mut fused: Vec<FusedHit> = order.iter().filter_map(|id| hits.remove(id)).collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.semantic_score
                    .partial_cmp(&a.semantic_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    fused
}
