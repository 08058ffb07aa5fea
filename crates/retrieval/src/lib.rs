//! Hybrid retrieval for Parley.
//!
//! Semantic search, BM25 lexical search, Reciprocal Rank Fusion, Jaccard
//! diversity filtering and token budgeting over an identity-partitioned
//! chunk index.

pub mod bm25;
pub mod diversity;
pub mod embedder;
pub mod in_memory;
pub mod ingest;
pub mod pipeline;
pub mod text;
pub mod tokens;
pub mod vector;

pub use bm25::Bm25;
pub use diversity::{diversify, jaccard_similarity};
pub use embedder::HashingEmbedder;
pub use in_memory::InMemoryIndex;
pub use ingest::{Ingestor, chunk_text};
pub use pipeline::{PipelineSettings, RetrievalOptions, RetrievalPipeline};
pub use tokens::{HeuristicCounter, TokenCounter, estimate_tokens};
pub use vector::{cosine_similarity, reciprocal_rank_fusion};

#[cfg(feature = "hf-tokenizer")]
pub use tokens::HfTokenCounter;
