//! Document ingestion: split, embed, index.

use chrono::Utc;
use parley_core::error::RetrievalError;
use parley_core::retrieval::{ChunkIndex, ChunkRecord, EmbeddingService};
use parley_core::IdentityPartition;
use std::sync::Arc;
use uuid::Uuid;

/// Split text into chunks of at most `max_chars` bytes.
///
/// Paragraphs (separated by blank lines) are packed together while they fit;
/// a paragraph longer than `max_chars` is cut at the last whitespace before
/// the limit, or hard-cut at a char boundary when there is none.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + 2 + paragraph.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph.len() > max_chars {
            chunks.extend(split_long(paragraph, max_chars));
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;

    while rest.len() > max_chars {
        let mut end = max_chars;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let cut = rest[..end]
            .rfind(char::is_whitespace)
            .filter(|i| *i > 0)
            .unwrap_or(end);
        // A multi-byte first char wider than the limit still has to advance.
        let cut = if cut == 0 {
            rest.chars().next().map(char::len_utf8).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Splits documents, embeds the chunks and inserts them into an identity's
/// partition.
pub struct Ingestor {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn ChunkIndex>,
    max_chars: usize,
}

impl Ingestor {
    pub fn new(embedder: Arc<dyn EmbeddingService>, index: Arc<dyn ChunkIndex>) -> Self {
        Self {
            embedder,
            index,
            max_chars: 1200,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Ingest one document. Returns the number of chunks indexed.
    pub async fn ingest(
        &self,
        identity: &IdentityPartition,
        document_id: &str,
        text: &str,
    ) -> Result<usize, RetrievalError> {
        let pieces = chunk_text(text, self.max_chars);
        let mut records = Vec::with_capacity(pieces.len());

        for (i, piece) in pieces.into_iter().enumerate() {
            let embedding = self.embedder.embed(&piece).await.map_err(|e| {
                RetrievalError::Ingestion(format!("{document_id} chunk {i}: {e}"))
            })?;
            records.push(ChunkRecord {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                identity: identity.clone(),
                text: piece,
                embedding,
                ingested_at: Utc::now(),
            });
        }

        let inserted = self.index.insert(records).await?;
        tracing::debug!(
            identity = %identity,
            document_id,
            chunks = inserted,
            "Ingested document"
        );
        Ok(inserted)
    }
}
