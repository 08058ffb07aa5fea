//! Okapi BM25 lexical scoring over one partition's chunks.

use std::collections::HashMap;

use parley_core::{ChunkRecord, ScoredChunk};

use crate::text::tokenize;
use crate::vector::sort_by_score;

/// BM25 parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25 {
    /// Term-frequency saturation
    pub k1: f32,
    /// Length normalization
    pub b: f32,
}

impl Default for Bm25 {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl Bm25 {
    pub fn new(k1: f32, b: f32) -> Self {
        Self { k1, b }
    }

    /// Score every chunk against `terms` and return the positive-scoring
    /// ones, highest first.
    ///
    /// Document frequencies and the average length are taken over `chunks`,
    /// so callers must pass exactly one partition's corpus.
    pub fn rank(&self, chunks: &[ChunkRecord], terms: &[String], limit: usize) -> Vec<ScoredChunk> {
        if chunks.is_empty() || terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let docs: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();
        let n = docs.len() as f32;
        let avgdl = docs.iter().map(|d| d.len()).sum::<usize>() as f32 / n;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in terms {
            let df = docs
                .iter()
                .filter(|d| d.iter().any(|w| w == term))
                .count();
            doc_freq.insert(term.as_str(), df);
        }

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .zip(docs.iter())
            .filter_map(|(chunk, words)| {
                let score = self.score_document(words, terms, &doc_freq, n, avgdl);
                (score > 0.0).then(|| ScoredChunk {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    text: chunk.text.clone(),
                    score,
                    identity: chunk.identity.clone(),
                })
            })
            .collect();

        sort_by_score(&mut scored);
        scored.truncate(limit);
        scored
    }

    fn score_document(
        &self,
        words: &[String],
        terms: &[String],
        doc_freq: &HashMap<&str, usize>,
        n: f32,
        avgdl: f32,
    ) -> f32 {
        let dl = words.len() as f32;
        let norm = if avgdl > 0.0 {
            1.0 - self.b + self.b * dl / avgdl
        } else {
            1.0
        };

        terms
            .iter()
            .map(|term| {
                let tf = words.iter().filter(|w| *w == term).count() as f32;
                if tf == 0.0 {
                    return 0.0;
                }
                let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                idf * tf * (self.k1 + 1.0) / (tf + self.k1 * norm)
            })
            .sum()
    }
}
