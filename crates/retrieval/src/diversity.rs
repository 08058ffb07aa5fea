//! Near-duplicate suppression by token-set Jaccard similarity.

use std::collections::HashSet;

use parley_core::RetrievalCandidate;

use crate::text::token_set;

/// |A ∩ B| / |A ∪ B|. Two empty sets are identical.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

/// Keep candidates in order, rejecting any whose maximum Jaccard similarity
/// against an already accepted candidate exceeds `threshold`.
///
/// Input must already be sorted by fused score descending.
pub fn diversify(candidates: Vec<RetrievalCandidate>, threshold: f32) -> Vec<RetrievalCandidate> {
    let mut accepted: Vec<RetrievalCandidate> = Vec::with_capacity(candidates.len());
    let mut accepted_sets: Vec<HashSet<String>> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let words = token_set(&candidate.text);
        let max_overlap = accepted_sets
            .iter()
            .map(|s| jaccard_similarity(s, &words))
            .fold(0.0f32, f32::max);

        if max_overlap > threshold {
            tracing::debug!(
                chunk_id = %candidate.chunk_id,
                overlap = max_overlap,
                "Dropping near-duplicate chunk"
            );
            continue;
        }

        accepted_sets.push(words);
        accepted.push(candidate);
    }

    accepted
}
