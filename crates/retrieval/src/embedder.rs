//! Offline embedding via feature hashing.
//!
//! Each word is hashed into one of `dimensions` buckets with a hash-derived
//! sign; the resulting bag-of-words vector is L2 normalized. Texts sharing
//! vocabulary get high cosine similarity, which is enough for tests and for
//! running without an embedding endpoint.

use async_trait::async_trait;
use parley_core::error::RetrievalError;
use parley_core::retrieval::EmbeddingService;

use crate::text::tokenize;

pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Synchronous embedding, for callers outside an async context.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in tokenize(text) {
            let hash = fnv1a(word.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingService for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self.embed_text(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn embedding_is_normalized() {
        let v = HashingEmbedder::default().embed_text("quarterly budget review");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn embedding_is_deterministic() {
        let e = HashingEmbedder::new(64);
        assert_eq!(e.embed_text("same text"), e.embed_text("same text"));
    }

    #[test]
    fn shared_vocabulary_is_similar() {
        let e = HashingEmbedder::default();
        let q = e.embed_text("budget review");
        let close = e.embed_text("the budget review meeting");
        let far = e.embed_text("penguins swim in antarctica");
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_text("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn async_embed_matches_sync() {
        let e = HashingEmbedder::new(32);
        assert_eq!(e.embed("hello").await.unwrap(), e.embed_text("hello"));
    }
}
