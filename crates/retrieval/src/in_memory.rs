//! In-memory chunk index, partitioned by identity.
//!
//! Each identity owns a separate chunk list; searches only ever read the
//! requested partition. Reads run concurrently under a `tokio` `RwLock`,
//! and a search started during ingestion sees the partition either before
//! or after the insert.

use async_trait::async_trait;
use parley_core::error::RetrievalError;
use parley_core::retrieval::{ChunkIndex, ChunkRecord, ScoredChunk};
use parley_core::IdentityPartition;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bm25::Bm25;
use crate::vector::rank_by_similarity;

pub struct InMemoryIndex {
    partitions: Arc<RwLock<HashMap<IdentityPartition, Vec<ChunkRecord>>>>,
    bm25: Bm25,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(RwLock::new(HashMap::new())),
            bm25: Bm25::default(),
        }
    }

    pub fn with_bm25(mut self, bm25: Bm25) -> Self {
        self.bm25 = bm25;
        self
    }

    /// Drop every chunk of one partition. Returns how many were removed.
    pub async fn clear_partition(&self, identity: &IdentityPartition) -> usize {
        self.partitions
            .write()
            .await
            .remove(identity)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        identity: &IdentityPartition,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(identity)
            .map(|chunks| rank_by_similarity(chunks, vector, top_k))
            .unwrap_or_default())
    }

    async fn lexical_search(
        &self,
        terms: &[String],
        identity: &IdentityPartition,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(identity)
            .map(|chunks| self.bm25.rank(chunks, terms, top_k))
            .unwrap_or_default())
    }

    async fn insert(&self, chunks: Vec<ChunkRecord>) -> Result<usize, RetrievalError> {
        let count = chunks.len();
        let mut partitions = self.partitions.write().await;
        for mut chunk in chunks {
            if chunk.id.is_empty() {
                chunk.id = Uuid::new_v4().to_string();
            }
            partitions
                .entry(chunk.identity.clone())
                .or_default()
                .push(chunk);
        }
        Ok(count)
    }

    async fn count(&self, identity: &IdentityPartition) -> Result<usize, RetrievalError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(identity)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(identity: &IdentityPartition, text: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: String::new(),
            document_id: "doc".into(),
            identity: identity.clone(),
            text: text.into(),
            embedding,
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_counts_per_partition() {
        let index = InMemoryIndex::new();
        let alice = IdentityPartition::user("alice");
        let bob = IdentityPartition::user("bob");

        index
            .insert(vec![
                chunk(&alice, "one", vec![1.0]),
                chunk(&alice, "two", vec![1.0]),
                chunk(&bob, "three", vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(index.count(&alice).await.unwrap(), 2);
        assert_eq!(index.count(&bob).await.unwrap(), 1);
        let hits = index.vector_search(&[1.0], &alice, 10).await.unwrap();
        assert!(hits.iter().all(|h| !h.chunk_id.is_empty()));
    }

    #[tokio::test]
    async fn searches_never_cross_partitions() {
        let index = InMemoryIndex::new();
        let alice = IdentityPartition::user("alice");
        let bob = IdentityPartition::user("bob");

        index
            .insert(vec![
                chunk(&alice, "alice secret budget", vec![1.0, 0.0]),
                chunk(&bob, "bob secret budget", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let semantic = index.vector_search(&[1.0, 0.0], &alice, 10).await.unwrap();
        let lexical = index
            .lexical_search(&["budget".into()], &alice, 10)
            .await
            .unwrap();

        assert_eq!(semantic.len(), 1);
        assert_eq!(lexical.len(), 1);
        assert!(semantic.iter().chain(lexical.iter()).all(|h| h.identity == alice));
    }

    #[tokio::test]
    async fn unknown_partition_is_empty() {
        let index = InMemoryIndex::new();
        let nobody = IdentityPartition::guest("nobody");
        assert!(index.vector_search(&[1.0], &nobody, 5).await.unwrap().is_empty());
        assert_eq!(index.count(&nobody).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_partition_only_touches_one_identity() {
        let index = InMemoryIndex::new();
        let alice = IdentityPartition::user("alice");
        let bob = IdentityPartition::user("bob");
        index
            .insert(vec![chunk(&alice, "a", vec![1.0]), chunk(&bob, "b", vec![1.0])])
            .await
            .unwrap();

        assert_eq!(index.clear_partition(&alice).await, 1);
        assert_eq!(index.count(&alice).await.unwrap(), 0);
        assert_eq!(index.count(&bob).await.unwrap(), 1);
    }
}
